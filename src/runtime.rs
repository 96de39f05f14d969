use serde_json::Number;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::consensus::{ConsensusResolver, Resolution};
use crate::ledger::{Ledger, LedgerError};
use crate::pow;
use crate::storage::{BlockStore, MemoryStorage, SledStorage, StorageError};
use crate::sync::{ChainSource, HttpChainSource, PeerRegistry, SyncError};
use crate::types::{Block, ChainResponse};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Sync error: {0}")]
    SyncError(#[from] SyncError),
    #[error("Blocking task failed: {0}")]
    BlockingTask(#[from] tokio::task::JoinError),
}

/// A running node: the ledger, its peers and where its blocks are kept.
///
/// Chain writers (minting, replacement) hold `commit` for their whole
/// store-then-ledger update, so the stored log and the ledger never disagree.
/// The ledger lock itself is only held for in-memory reads and swaps; proof
/// search, validation and disk writes run on the blocking pool.
pub struct Runtime {
    ledger: RwLock<Ledger>,
    commit: tokio::sync::Mutex<()>,
    peers: RwLock<PeerRegistry>,
    store: Arc<dyn BlockStore>,
    resolver: ConsensusResolver,
    client: reqwest::Client,
    mining: Mutex<CancellationToken>,
}

impl Runtime {
    /// Build a runtime on top of `store`, seeding genesis into an empty store.
    pub fn new(config: &NodeConfig, store: Arc<dyn BlockStore>) -> Result<Self, RuntimeError> {
        let stored = store.load_chain()?;
        let ledger = if stored.is_empty() {
            let ledger = Ledger::with_genesis(&config.genesis)?;
            store.append_block(ledger.tip())?;
            ledger
        } else {
            info!(length = stored.len(), "loaded chain from store");
            Ledger::from_chain(stored)?
        };

        let mut peers = PeerRegistry::new();
        for address in &config.peers {
            peers.register(address)?;
        }

        Ok(Runtime {
            ledger: RwLock::new(ledger),
            commit: tokio::sync::Mutex::new(()),
            peers: RwLock::new(peers),
            store,
            resolver: ConsensusResolver::from_config(&config.consensus),
            client: HttpChainSource::client(config.consensus.peer_timeout())?,
            mining: Mutex::new(CancellationToken::new()),
        })
    }

    /// Runtime backed by sled when `data_dir` is set, in memory otherwise.
    pub fn open(config: &NodeConfig) -> Result<Self, RuntimeError> {
        let store: Arc<dyn BlockStore> = match &config.data_dir {
            Some(dir) => {
                info!(path = %dir.display(), "opening block log");
                Arc::new(SledStorage::new(dir)?)
            }
            None => Arc::new(MemoryStorage::new()),
        };
        Self::new(config, store)
    }

    /// Queue a transaction; returns the index of the block that will hold it.
    pub async fn new_transaction(
        &self,
        sender: String,
        recipient: String,
        amount: impl Into<Number>,
    ) -> u64 {
        let amount = amount.into();
        let index = self
            .ledger
            .write()
            .await
            .new_transaction(sender, recipient, amount.clone());
        debug!(index, %amount, "queued transaction");
        index
    }

    /// Find a proof for the tip and mint the next block.
    ///
    /// If the chain is replaced while searching, the search is cancelled and
    /// restarted against the new tip. The block reaches the ledger only once
    /// the store has accepted it.
    pub async fn mine(&self) -> Result<Block, RuntimeError> {
        loop {
            let last_proof = self.ledger.read().await.tip().proof;
            let cancel = self.mining_token();

            let found = tokio::task::spawn_blocking(move || pow::find_proof_until(last_proof, &cancel))
                .await?;
            let Some(proof) = found else {
                debug!(last_proof, "proof search superseded, restarting");
                continue;
            };

            let _commit = self.commit.lock().await;
            let block = {
                let ledger = self.ledger.read().await;
                if !pow::valid_proof(ledger.tip().proof, proof) {
                    debug!(last_proof, "tip moved during proof search, restarting");
                    continue;
                }
                ledger.next_block(proof, None)?
            };

            let store = Arc::clone(&self.store);
            let record = block.clone();
            tokio::task::spawn_blocking(move || store.append_block(&record)).await??;
            self.ledger.write().await.push_block(block.clone());

            info!(
                index = block.index,
                proof = block.proof,
                transactions = block.transactions.len(),
                "forged block"
            );
            return Ok(block);
        }
    }

    /// Snapshot of the chain in the form served to peers.
    pub async fn chain(&self) -> ChainResponse {
        let snapshot = self.ledger.read().await.chain();
        ChainResponse::new(snapshot.to_vec())
    }

    pub async fn register_node(&self, address: &str) -> Result<String, SyncError> {
        let node = self.peers.write().await.register(address)?;
        info!(%node, "registered peer");
        Ok(node)
    }

    pub async fn peers(&self) -> Vec<String> {
        self.peers.read().await.iter().map(str::to_string).collect()
    }

    /// Ask every registered peer for its chain and adopt the longest valid one.
    ///
    /// Never fails: unreachable peers and bad chains just lose the vote.
    pub async fn resolve_conflicts(&self) -> Resolution {
        let sources: Vec<Arc<dyn ChainSource>> = self
            .peers
            .read()
            .await
            .iter()
            .map(|node| Arc::new(HttpChainSource::new(node, self.client.clone())) as Arc<dyn ChainSource>)
            .collect();
        self.resolve_with(&sources).await
    }

    /// Resolution round against an explicit set of sources.
    ///
    /// The winner comes back from the resolver already validated. It is
    /// persisted before the ledger switches to it; if that fails the local
    /// chain stays.
    pub async fn resolve_with(&self, sources: &[Arc<dyn ChainSource>]) -> Resolution {
        let local = self.ledger.read().await.chain();
        let resolution = self.resolver.resolve_with(local, sources).await;
        if !resolution.replaced {
            return resolution;
        }

        let _commit = self.commit.lock().await;
        let current = self.ledger.read().await.chain();
        if resolution.chain.len() <= current.len() {
            info!(
                local_length = current.len(),
                "local chain caught up during resolution, keeping it"
            );
            return Resolution {
                replaced: false,
                chain: current,
            };
        }

        let store = Arc::clone(&self.store);
        let winner = Arc::clone(&resolution.chain);
        let persisted = tokio::task::spawn_blocking(move || store.replace_chain(&winner))
            .await
            .map_err(RuntimeError::from)
            .and_then(|stored| stored.map_err(RuntimeError::from));
        if let Err(e) = persisted {
            warn!(error = %e, "failed to persist winning chain, keeping local chain");
            return Resolution {
                replaced: false,
                chain: current,
            };
        }

        self.ledger
            .write()
            .await
            .install_chain(Arc::clone(&resolution.chain));
        self.supersede_mining();
        resolution
    }

    fn mining_token(&self) -> CancellationToken {
        self.mining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn supersede_mining(&self) {
        let mut token = self.mining.lock().unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }
}

use serde_json::Number;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::GenesisConfig;
use crate::pow;
use crate::types::{Block, CryptoError, PreviousHash, Transaction};
use crate::validation::{validate_chain, ChainError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Invalid chain: {0}")]
    InvalidChain(#[from] ChainError),
}

/// The local chain plus the transactions waiting for the next block.
///
/// The chain sits behind an `Arc` so readers can hold a snapshot while the
/// ledger keeps appending; an append only copies the blocks when such a
/// snapshot is still alive.
#[derive(Debug, Clone)]
pub struct Ledger {
    chain: Arc<Vec<Block>>,
    current_transactions: Vec<Transaction>,
}

impl Ledger {
    /// Ledger seeded with the default genesis block.
    pub fn new() -> Result<Self, LedgerError> {
        Self::with_genesis(&GenesisConfig::default())
    }

    pub fn with_genesis(genesis: &GenesisConfig) -> Result<Self, LedgerError> {
        let mut ledger = Ledger {
            chain: Arc::new(Vec::new()),
            current_transactions: Vec::new(),
        };
        let block = ledger.new_block(genesis.proof, Some(genesis.previous_hash.clone()))?;
        info!(proof = block.proof, previous_hash = %block.previous_hash, "seeded genesis block");
        Ok(ledger)
    }

    /// Rebuild a ledger around an existing chain, e.g. one loaded from disk.
    pub fn from_chain(chain: Vec<Block>) -> Result<Self, LedgerError> {
        validate_chain(&chain)?;
        Ok(Ledger {
            chain: Arc::new(chain),
            current_transactions: Vec::new(),
        })
    }

    /// Queue a transaction for the next block and return that block's index.
    pub fn new_transaction(
        &mut self,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: impl Into<Number>,
    ) -> u64 {
        self.current_transactions
            .push(Transaction::new(sender, recipient, amount));
        self.tip().index + 1
    }

    /// Mint a block on top of the tip holding every pending transaction.
    ///
    /// Without an explicit `previous_hash` the block links to the digest of
    /// the current tip.
    pub fn new_block(
        &mut self,
        proof: u64,
        previous_hash: Option<PreviousHash>,
    ) -> Result<Block, LedgerError> {
        let block = self.next_block(proof, previous_hash)?;
        self.push_block(block.clone());
        Ok(block)
    }

    /// The block [`new_block`](Self::new_block) would mint, leaving the
    /// ledger untouched.
    pub fn next_block(
        &self,
        proof: u64,
        previous_hash: Option<PreviousHash>,
    ) -> Result<Block, LedgerError> {
        let previous_hash = match previous_hash {
            Some(link) => link,
            None => PreviousHash::Digest(self.tip().calculate_hash()?),
        };

        Ok(Block {
            index: self.chain.len() as u64 + 1,
            previous_hash,
            proof,
            timestamp: current_timestamp(),
            transactions: self.current_transactions.clone(),
        })
    }

    /// Append a block built by [`next_block`](Self::next_block).
    ///
    /// The block's transactions are the oldest pending ones; those are
    /// retired and anything queued since stays pending.
    pub fn push_block(&mut self, block: Block) {
        let included = block.transactions.len().min(self.current_transactions.len());
        self.current_transactions.drain(..included);
        debug!(index = block.index, transactions = block.transactions.len(), "appended block");
        Arc::make_mut(&mut self.chain).push(block);
    }

    /// Search a proof for the tip and mint the next block with it.
    pub fn mine(&mut self) -> Result<Block, LedgerError> {
        let proof = pow::find_proof(self.tip().proof);
        self.new_block(proof, None)
    }

    /// The last block of the chain.
    ///
    /// # Panics
    ///
    /// Panics if the chain is empty, which construction rules out.
    pub fn tip(&self) -> &Block {
        self.chain
            .last()
            .expect("ledger chain always holds its genesis block")
    }

    /// Shared snapshot of the whole chain.
    pub fn chain(&self) -> Arc<Vec<Block>> {
        Arc::clone(&self.chain)
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn pending_transactions(&self) -> &[Transaction] {
        &self.current_transactions
    }

    /// Swap in a whole new chain. Pending transactions are kept.
    pub fn replace_chain(&mut self, chain: Arc<Vec<Block>>) -> Result<(), LedgerError> {
        validate_chain(&chain)?;
        info!(old_length = self.chain.len(), new_length = chain.len(), "replacing chain");
        self.chain = chain;
        Ok(())
    }

    /// Swap in a chain the caller has already validated.
    pub(crate) fn install_chain(&mut self, chain: Arc<Vec<Block>>) {
        info!(old_length = self.chain.len(), new_length = chain.len(), "replacing chain");
        self.chain = chain;
    }
}

/// Unix time in fractional seconds.
pub fn current_timestamp() -> Number {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64());
    Number::from_f64(secs).unwrap_or_else(|| Number::from(0u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::is_valid;

    #[test]
    fn test_genesis_seeding() {
        let ledger = Ledger::new().unwrap();
        assert_eq!(ledger.len(), 1);
        let genesis = ledger.tip();
        assert_eq!(genesis.index, 1);
        assert_eq!(genesis.proof, 100);
        assert_eq!(genesis.previous_hash, PreviousHash::GENESIS);
        assert!(genesis.transactions.is_empty());
    }

    #[test]
    fn test_custom_genesis() {
        let genesis = GenesisConfig {
            proof: 7,
            previous_hash: PreviousHash::Sentinel(0),
        };
        let ledger = Ledger::with_genesis(&genesis).unwrap();
        assert_eq!(ledger.tip().proof, 7);
        assert_eq!(ledger.tip().previous_hash, PreviousHash::Sentinel(0));
    }

    #[test]
    fn test_new_transaction_returns_next_index() {
        let mut ledger = Ledger::new().unwrap();
        assert_eq!(ledger.new_transaction("alice", "bob", 5), 2);
        assert_eq!(ledger.new_transaction("bob", "carol", 1), 2);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.pending_transactions().len(), 2);
    }

    #[test]
    fn test_new_block_links_to_tip() {
        let mut ledger = Ledger::new().unwrap();
        let tip_hash = ledger.tip().calculate_hash().unwrap();
        let block = ledger.new_block(35293, None).unwrap();
        assert_eq!(block.index, 2);
        assert!(block.previous_hash.links_to(&tip_hash));
        assert_eq!(ledger.tip(), &block);
        assert!(is_valid(&ledger.chain()));
    }

    #[test]
    fn test_transactions_land_in_exactly_one_block() {
        let mut ledger = Ledger::new().unwrap();
        ledger.new_transaction("alice", "bob", 5);
        let first = ledger.mine().unwrap();
        assert!(ledger.pending_transactions().is_empty());
        assert_eq!(first.transactions, vec![Transaction::new("alice", "bob", 5)]);

        let second = ledger.mine().unwrap();
        assert!(second.transactions.is_empty());

        let holding: usize = ledger
            .chain()
            .iter()
            .filter(|b| b.transactions.iter().any(|t| t.sender == "alice"))
            .count();
        assert_eq!(holding, 1);
    }

    #[test]
    fn test_mine_uses_tip_proof() {
        let mut ledger = Ledger::new().unwrap();
        let block = ledger.mine().unwrap();
        assert_eq!(block.proof, 35293);
        assert_eq!(ledger.mine().unwrap().proof, 35089);
        assert!(is_valid(&ledger.chain()));
    }

    #[test]
    fn test_snapshot_survives_append() {
        let mut ledger = Ledger::new().unwrap();
        let snapshot = ledger.chain();
        ledger.new_block(35293, None).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_next_block_leaves_ledger_untouched() {
        let mut ledger = Ledger::new().unwrap();
        ledger.new_transaction("alice", "bob", 5);
        let block = ledger.next_block(35293, None).unwrap();
        assert_eq!(block.index, 2);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.pending_transactions().len(), 1);

        // queued after the block was built, so it waits for the next one
        let half = Number::from_f64(2.5).unwrap();
        ledger.new_transaction("carol", "dave", half.clone());
        ledger.push_block(block.clone());
        assert_eq!(ledger.tip(), &block);
        assert_eq!(
            ledger.pending_transactions(),
            &[Transaction::new("carol", "dave", half)]
        );
        assert!(is_valid(&ledger.chain()));
    }

    #[test]
    fn test_replace_chain_rejects_invalid() {
        let mut other = Ledger::new().unwrap();
        other.mine().unwrap();
        other.mine().unwrap();

        let mut ledger = Ledger::new().unwrap();
        ledger.new_transaction("alice", "bob", 1);

        let mut broken = other.chain().to_vec();
        broken[1].proof += 1;
        assert!(ledger.replace_chain(Arc::new(broken)).is_err());
        assert_eq!(ledger.len(), 1);

        ledger.replace_chain(other.chain()).unwrap();
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.pending_transactions().len(), 1);
        assert_eq!(ledger.new_transaction("carol", "dave", 2), 4);
    }

    #[test]
    fn test_from_chain() {
        let mut other = Ledger::new().unwrap();
        other.mine().unwrap();
        let rebuilt = Ledger::from_chain(other.chain().to_vec()).unwrap();
        assert_eq!(rebuilt.tip(), other.tip());
        assert!(matches!(
            Ledger::from_chain(Vec::new()),
            Err(LedgerError::InvalidChain(ChainError::Empty))
        ));
    }
}

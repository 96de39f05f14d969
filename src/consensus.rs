//! Longest-valid-chain consensus.
//!
//! A node adopts a peer's chain only when it is strictly longer than every
//! chain seen so far in the round (its own included) and validates end to
//! end. Chains are never merged: the winner replaces the local chain whole.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::ConsensusConfig;
use crate::sync::{ChainSource, SyncError};
use crate::types::{Block, ChainResponse};
use crate::validation::validate_chain;

/// Outcome of a resolution round.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub replaced: bool,
    pub chain: Arc<Vec<Block>>,
}

/// Pick the chain a node should hold after hearing from its peers.
///
/// Responses are considered in the order given; on equal lengths the one
/// seen first (or the local chain) stays. Failed fetches, a `length` that
/// disagrees with the blocks sent, and chains that do not validate are all
/// skipped rather than treated as errors.
pub fn resolve<I>(local_chain: Arc<Vec<Block>>, peer_responses: I) -> Resolution
where
    I: IntoIterator<Item = Result<ChainResponse, SyncError>>,
{
    let mut max_length = local_chain.len();
    let mut best: Option<Vec<Block>> = None;

    for (slot, response) in peer_responses.into_iter().enumerate() {
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(slot, error = %e, "skipping peer");
                continue;
            }
        };

        if response.length != response.chain.len() {
            warn!(
                slot,
                claimed = response.length,
                actual = response.chain.len(),
                "skipping peer with inconsistent chain length"
            );
            continue;
        }

        if response.chain.len() <= max_length {
            continue;
        }

        match validate_chain(&response.chain) {
            Ok(()) => {
                debug!(slot, length = response.chain.len(), "new longest valid chain");
                max_length = response.chain.len();
                best = Some(response.chain);
            }
            Err(e) => warn!(slot, error = %e, "rejecting peer chain"),
        }
    }

    match best {
        Some(chain) => Resolution {
            replaced: true,
            chain: Arc::new(chain),
        },
        None => Resolution {
            replaced: false,
            chain: local_chain,
        },
    }
}

/// Fetches peer chains concurrently and applies [`resolve`].
#[derive(Debug, Clone)]
pub struct ConsensusResolver {
    peer_timeout: Duration,
    deadline: Duration,
}

impl ConsensusResolver {
    pub fn new(peer_timeout: Duration, deadline: Duration) -> Self {
        Self {
            peer_timeout,
            deadline,
        }
    }

    pub fn from_config(config: &ConsensusConfig) -> Self {
        Self::new(config.peer_timeout(), config.resolve_deadline())
    }

    /// Fetch every source at once, each bounded by the per-peer timeout and
    /// the whole round by the deadline.
    ///
    /// The returned vector lines up with `sources`; a peer that did not
    /// answer in time shows up as [`SyncError::Timeout`].
    pub async fn gather(
        &self,
        sources: &[Arc<dyn ChainSource>],
    ) -> Vec<Result<ChainResponse, SyncError>> {
        let mut tasks = JoinSet::new();
        for (slot, source) in sources.iter().enumerate() {
            let source = Arc::clone(source);
            let peer_timeout = self.peer_timeout;
            tasks.spawn(async move {
                let result = match timeout(peer_timeout, source.fetch()).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout {
                        peer: source.peer().to_string(),
                    }),
                };
                (slot, result)
            });
        }

        let mut results: Vec<Option<Result<ChainResponse, SyncError>>> =
            sources.iter().map(|_| None).collect();
        let deadline = Instant::now() + self.deadline;
        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((slot, result)))) => results[slot] = Some(result),
                Ok(Some(Err(e))) => warn!(error = %e, "peer fetch task failed"),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = tasks.len(), "resolution deadline reached");
                    tasks.abort_all();
                    break;
                }
            }
        }

        results
            .into_iter()
            .zip(sources)
            .map(|(result, source)| {
                result.unwrap_or_else(|| {
                    Err(SyncError::Timeout {
                        peer: source.peer().to_string(),
                    })
                })
            })
            .collect()
    }

    /// Gather from `sources` and resolve against `local_chain`.
    pub async fn resolve_with(
        &self,
        local_chain: Arc<Vec<Block>>,
        sources: &[Arc<dyn ChainSource>],
    ) -> Resolution {
        let responses = self.gather(sources).await;
        let local_len = local_chain.len();
        let resolution = match tokio::task::spawn_blocking({
            let local_chain = Arc::clone(&local_chain);
            move || resolve(local_chain, responses)
        })
        .await
        {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(error = %e, "chain validation task failed");
                Resolution {
                    replaced: false,
                    chain: local_chain,
                }
            }
        };
        info!(
            peers = sources.len(),
            replaced = resolution.replaced,
            local_length = local_len,
            length = resolution.chain.len(),
            "resolution round finished"
        );
        resolution
    }
}

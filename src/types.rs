//! Core type definitions for the hashchain ledger.
//!
//! This module contains the records exchanged between nodes: blocks,
//! transactions, the link to a predecessor block and the `/chain`
//! payload peers serve to each other.

use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::fmt;
use thiserror::Error;

use crate::hasher;

/// Errors that can occur while digesting ledger records.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Hash conversion error: {0}")]
    HashConversion(String),
}

/// Link from a block to its predecessor.
///
/// Every block but the first stores the hex digest of the block before it.
/// The genesis block has nothing to point at and stores an agreed sentinel
/// instead, which is serialized as a bare integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreviousHash {
    Sentinel(u64),
    Digest(String),
}

impl PreviousHash {
    /// The sentinel stored in the genesis block unless configured otherwise.
    pub const GENESIS: PreviousHash = PreviousHash::Sentinel(1);

    /// Returns true if this link names exactly the given digest.
    pub fn links_to(&self, digest: &str) -> bool {
        matches!(self, PreviousHash::Digest(d) if d == digest)
    }
}

impl fmt::Display for PreviousHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreviousHash::Sentinel(v) => write!(f, "{v}"),
            PreviousHash::Digest(d) => f.write_str(d),
        }
    }
}

impl From<String> for PreviousHash {
    fn from(digest: String) -> Self {
        PreviousHash::Digest(digest)
    }
}

/// A block in the chain.
///
/// Fields are declared in name order. That order is the canonical hashing
/// order, so keep it sorted when touching this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Position in the chain, starting at 1 for genesis
    pub index: u64,
    /// Digest of the previous block, or the genesis sentinel
    pub previous_hash: PreviousHash,
    /// Proof-of-work answer relative to the previous block's proof
    pub proof: u64,
    /// Unix timestamp in seconds, advisory only. Kept as the JSON number it
    /// arrived as so integer and fractional forms digest as written.
    pub timestamp: Number,
    /// Transactions that were pending when the block was minted
    pub transactions: Vec<Transaction>,
}

/// A transfer recorded in a block.
///
/// Purely a payload: balances and signatures are never checked. `amount`
/// may be any JSON number. Fields are in canonical hashing order, same as
/// [`Block`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub amount: Number,
    pub recipient: String,
    pub sender: String,
}

impl Transaction {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: impl Into<Number>,
    ) -> Self {
        Transaction {
            amount: amount.into(),
            recipient: recipient.into(),
            sender: sender.into(),
        }
    }
}

impl Block {
    /// Calculate the SHA-256 digest of the block as lowercase hex.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HashConversion` if canonical serialization fails.
    pub fn calculate_hash(&self) -> Result<String, CryptoError> {
        hasher::hash(self)
    }
}

/// Full-state snapshot served on `GET /chain` and fetched from peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainResponse {
    pub length: usize,
    pub chain: Vec<Block>,
}

impl ChainResponse {
    pub fn new(chain: Vec<Block>) -> Self {
        ChainResponse {
            length: chain.len(),
            chain,
        }
    }
}

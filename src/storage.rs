use sled::{Db, Tree};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

use crate::hasher::canonical_bytes;
use crate::types::{Block, CryptoError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Block log has a gap: expected height {expected}, found {found}")]
    Gap { expected: u64, found: u64 },
    #[error("Malformed block log key: {0}")]
    BadKey(String),
}

/// Append-only home of a node's chain.
pub trait BlockStore: Send + Sync {
    /// Store `block` at the next height, whatever its own `index` says.
    fn append_block(&self, block: &Block) -> Result<(), StorageError>;
    /// Every stored block in height order.
    fn load_chain(&self) -> Result<Vec<Block>, StorageError>;
    /// Drop the stored chain and write `chain` in its place, atomically.
    fn replace_chain(&self, chain: &[Block]) -> Result<(), StorageError>;
    fn chain_height(&self) -> Result<u64, StorageError>;
}

/// Keeps blocks for the lifetime of the process only.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blocks: Mutex<Vec<Block>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryStorage {
    fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(block.clone());
        Ok(())
    }

    fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        Ok(self
            .blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn replace_chain(&self, chain: &[Block]) -> Result<(), StorageError> {
        *self.blocks.lock().unwrap_or_else(PoisonError::into_inner) = chain.to_vec();
        Ok(())
    }

    fn chain_height(&self) -> Result<u64, StorageError> {
        Ok(self.blocks.lock().unwrap_or_else(PoisonError::into_inner).len() as u64)
    }
}

/// sled-backed block log.
///
/// Blocks are keyed by their zero-padded position in the chain so a prefix
/// scan yields chain order, and stored in canonical form so a reloaded block digests exactly
/// as it did when it was written.
pub struct SledStorage {
    db: Db,
    blocks_tree: Tree,
}

const HEIGHT_PREFIX: &str = "height:";

fn height_key(height: u64) -> String {
    format!("{HEIGHT_PREFIX}{:0>20}", height)
}

fn key_height(key: &[u8]) -> Result<u64, StorageError> {
    std::str::from_utf8(key)
        .ok()
        .and_then(|k| k.strip_prefix(HEIGHT_PREFIX))
        .and_then(|h| h.parse().ok())
        .ok_or_else(|| StorageError::BadKey(String::from_utf8_lossy(key).into_owned()))
}

impl SledStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            blocks_tree: db.open_tree("blocks")?,
            db,
        })
    }
}

impl BlockStore for SledStorage {
    fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        let encoded = canonical_bytes(block)?;
        let height = self.chain_height()? + 1;
        self.blocks_tree.insert(height_key(height), encoded)?;
        self.db.flush()?;
        Ok(())
    }

    fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        let mut chain = Vec::new();
        for item in self.blocks_tree.scan_prefix(HEIGHT_PREFIX) {
            let (key, encoded) = item?;
            let expected = chain.len() as u64 + 1;
            let found = key_height(&key)?;
            if found != expected {
                return Err(StorageError::Gap { expected, found });
            }
            chain.push(serde_json::from_slice(&encoded)?);
        }
        Ok(chain)
    }

    fn replace_chain(&self, chain: &[Block]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for key in self.blocks_tree.scan_prefix(HEIGHT_PREFIX).keys() {
            batch.remove(key?);
        }
        for (height, block) in (1..).zip(chain) {
            batch.insert(height_key(height).as_bytes(), canonical_bytes(block)?);
        }
        self.blocks_tree.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    fn chain_height(&self) -> Result<u64, StorageError> {
        match self.blocks_tree.scan_prefix(HEIGHT_PREFIX).keys().next_back() {
            Some(key) => key_height(&key?),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;

    fn mined_chain(blocks: usize) -> Vec<Block> {
        let mut ledger = Ledger::new().unwrap();
        for i in 1..blocks {
            ledger.new_transaction("n\u{f6}de", "peer", i as u64);
            ledger.mine().unwrap();
        }
        ledger.chain().to_vec()
    }

    #[test]
    fn test_sled_reload_preserves_digests() {
        let dir = tempfile::tempdir().unwrap();
        let chain = mined_chain(3);
        {
            let store = SledStorage::new(dir.path()).unwrap();
            for block in &chain {
                store.append_block(block).unwrap();
            }
            assert_eq!(store.chain_height().unwrap(), 3);
        }

        let store = SledStorage::new(dir.path()).unwrap();
        let loaded = store.load_chain().unwrap();
        assert_eq!(loaded, chain);
        for (a, b) in loaded.iter().zip(&chain) {
            assert_eq!(a.calculate_hash().unwrap(), b.calculate_hash().unwrap());
        }
    }

    #[test]
    fn test_sled_replace_is_total() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStorage::new(dir.path()).unwrap();
        for block in &mined_chain(4) {
            store.append_block(block).unwrap();
        }

        let shorter = mined_chain(2);
        store.replace_chain(&shorter).unwrap();
        assert_eq!(store.load_chain().unwrap(), shorter);
        assert_eq!(store.chain_height().unwrap(), 2);
    }

    #[test]
    fn test_sled_detects_gap() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStorage::new(dir.path()).unwrap();
        let chain = mined_chain(3);
        store.append_block(&chain[0]).unwrap();
        store
            .blocks_tree
            .insert(height_key(3), canonical_bytes(&chain[2]).unwrap())
            .unwrap();
        assert!(matches!(
            store.load_chain(),
            Err(StorageError::Gap { expected: 2, found: 3 })
        ));
    }

    #[test]
    fn test_sled_keys_by_position_not_block_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = mined_chain(3);
        chain[1].index = 9;
        chain[2].index = 9;
        {
            let store = SledStorage::new(dir.path()).unwrap();
            store.replace_chain(&chain[..2]).unwrap();
            store.append_block(&chain[2]).unwrap();
            assert_eq!(store.chain_height().unwrap(), 3);
        }

        let store = SledStorage::new(dir.path()).unwrap();
        assert_eq!(store.load_chain().unwrap(), chain);
    }

    #[test]
    fn test_key_height() {
        assert_eq!(key_height(height_key(42).as_bytes()).unwrap(), 42);
        assert!(matches!(key_height(b"height:x"), Err(StorageError::BadKey(_))));
    }

    #[test]
    fn test_memory_storage() {
        let store = MemoryStorage::new();
        assert_eq!(store.chain_height().unwrap(), 0);
        let chain = mined_chain(2);
        store.append_block(&chain[0]).unwrap();
        store.replace_chain(&chain).unwrap();
        assert_eq!(store.load_chain().unwrap(), chain);
        assert_eq!(store.chain_height().unwrap(), 2);
    }
}

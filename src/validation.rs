use thiserror::Error;
use tracing::debug;

use crate::pow::valid_proof;
use crate::types::{Block, CryptoError};

/// Reasons a candidate chain is rejected.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Chain has no blocks")]
    Empty,
    #[error("Block {index} does not link to the hash of its predecessor")]
    BrokenLink { index: u64 },
    #[error("Block {index} carries an invalid proof of work")]
    InvalidProof { index: u64 },
    #[error("Crypto error: {0}")]
    Hash(#[from] CryptoError),
}

/// Walk a candidate chain front to back and report the first bad block.
///
/// Genesis is never checked against anything, so a one-block chain is valid
/// whatever sentinel it carries.
pub fn validate_chain(chain: &[Block]) -> Result<(), ChainError> {
    let (mut last_block, rest) = chain.split_first().ok_or(ChainError::Empty)?;

    for block in rest {
        let last_hash = last_block.calculate_hash()?;
        if !block.previous_hash.links_to(&last_hash) {
            debug!(index = block.index, expected = %last_hash, got = %block.previous_hash, "broken link");
            return Err(ChainError::BrokenLink { index: block.index });
        }
        if !valid_proof(last_block.proof, block.proof) {
            debug!(index = block.index, last_proof = last_block.proof, proof = block.proof, "bad proof");
            return Err(ChainError::InvalidProof { index: block.index });
        }
        last_block = block;
    }

    Ok(())
}

/// True iff every block links to its predecessor and answers its proof.
pub fn is_valid(chain: &[Block]) -> bool {
    validate_chain(chain).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::types::{PreviousHash, Transaction};
    use serde_json::Number;

    fn mined_chain(blocks: usize) -> Vec<Block> {
        let mut ledger = Ledger::new().unwrap();
        for i in 1..blocks {
            ledger.new_transaction("alice", "bob", i as u64);
            ledger.mine().unwrap();
        }
        ledger.chain().to_vec()
    }

    #[test]
    fn test_genesis_alone_is_valid() {
        let chain = mined_chain(1);
        assert!(is_valid(&chain));

        let mut odd = chain.clone();
        odd[0].previous_hash = PreviousHash::Digest("not a digest".into());
        odd[0].proof = 7;
        assert!(is_valid(&odd));
    }

    #[test]
    fn test_empty_chain_is_invalid() {
        assert!(matches!(validate_chain(&[]), Err(ChainError::Empty)));
    }

    #[test]
    fn test_linked_pair_is_valid() {
        let genesis = mined_chain(1).remove(0);
        let next = Block {
            index: 2,
            previous_hash: genesis.calculate_hash().unwrap().into(),
            proof: crate::pow::find_proof(genesis.proof),
            timestamp: genesis.timestamp.clone(),
            transactions: vec![],
        };
        assert!(is_valid(&[genesis, next]));
    }

    #[test]
    fn test_any_field_mutation_breaks_chain() {
        let chain = mined_chain(3);
        assert!(is_valid(&chain));

        let mutations: Vec<Box<dyn Fn(&mut Block)>> = vec![
            Box::new(|b: &mut Block| b.index += 1),
            Box::new(|b: &mut Block| b.timestamp = Number::from(0u64)),
            Box::new(|b: &mut Block| b.proof += 1),
            Box::new(|b: &mut Block| b.previous_hash = PreviousHash::Digest("00".repeat(32))),
            Box::new(|b: &mut Block| b.transactions.push(Transaction::new("mallory", "mallory", 1))),
            Box::new(|b: &mut Block| b.transactions[0].amount = Number::from(999u64)),
        ];

        for (i, mutate) in mutations.iter().enumerate() {
            let mut tampered = chain.clone();
            mutate(&mut tampered[1]);
            assert!(!is_valid(&tampered), "mutation {i} went unnoticed");
        }
    }

    #[test]
    fn test_reports_first_bad_block() {
        let mut chain = mined_chain(5);
        chain[2].proof += 1;
        // block 3's proof no longer answers, and block 4 no longer links
        assert!(matches!(
            validate_chain(&chain[..3]),
            Err(ChainError::InvalidProof { index: 3 })
        ));
        assert!(matches!(
            validate_chain(&chain),
            Err(ChainError::InvalidProof { index: 3 })
        ));
    }

    #[test]
    fn test_validation_does_not_mutate() {
        let chain = mined_chain(3);
        let copy = chain.clone();
        let _ = is_valid(&chain);
        assert_eq!(chain, copy);
    }
}

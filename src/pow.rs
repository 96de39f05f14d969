//! Proof-of-work puzzle.
//!
//! A proof `p` answers the puzzle set by the previous proof `l` when
//! SHA-256 of the decimal text of `l` followed directly by the decimal text
//! of `p` starts with four hex zeros. Difficulty is fixed.

use sha2::{Digest, Sha256};
use std::fmt::Write;
use tokio_util::sync::CancellationToken;

/// Leading hex characters a proof digest must show.
pub const DIFFICULTY_PREFIX: &str = "0000";

/// Candidates tried between two checks of the cancellation token.
const CANCEL_POLL_INTERVAL: u64 = 4096;

fn proof_digest(guess: &str) -> [u8; 32] {
    Sha256::digest(guess.as_bytes()).into()
}

fn meets_target(digest: &[u8; 32]) -> bool {
    // "0000" in hex is the first two bytes being zero
    digest[0] == 0 && digest[1] == 0
}

/// Hex digest of the puzzle input for `(last_proof, proof)`.
pub fn proof_hash(last_proof: u64, proof: u64) -> String {
    hex::encode(proof_digest(&format!("{last_proof}{proof}")))
}

/// Validates that hash(last_proof, proof) starts with [`DIFFICULTY_PREFIX`].
pub fn valid_proof(last_proof: u64, proof: u64) -> bool {
    meets_target(&proof_digest(&format!("{last_proof}{proof}")))
}

/// Smallest non-negative proof answering `last_proof`.
pub fn find_proof(last_proof: u64) -> u64 {
    let mut guess = String::with_capacity(40);
    let mut proof = 0u64;
    loop {
        if check(&mut guess, last_proof, proof) {
            return proof;
        }
        proof += 1;
    }
}

/// Same search as [`find_proof`], giving up once `cancel` fires.
///
/// The token is polled every few thousand candidates, so cancellation takes
/// effect within a fraction of a millisecond on ordinary hardware.
pub fn find_proof_until(last_proof: u64, cancel: &CancellationToken) -> Option<u64> {
    let mut guess = String::with_capacity(40);
    let mut proof = 0u64;
    loop {
        if proof % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
            return None;
        }
        if check(&mut guess, last_proof, proof) {
            return Some(proof);
        }
        proof += 1;
    }
}

fn check(guess: &mut String, last_proof: u64, proof: u64) -> bool {
    guess.clear();
    // writing into a String cannot fail
    let _ = write!(guess, "{last_proof}{proof}");
    meets_target(&proof_digest(guess))
}

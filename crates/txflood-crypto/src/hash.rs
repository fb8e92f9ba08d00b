//! Keccak-256 hashing

use sha3::{Digest, Keccak256};
use txflood_primitives::H256;

/// Compute the Keccak-256 hash of `data`
pub fn keccak256(data: &[u8]) -> H256 {
    H256::from_bytes(Keccak256::digest(data).into())
}

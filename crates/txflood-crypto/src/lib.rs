//! # txflood-crypto
//!
//! - Keccak-256 hashing
//! - secp256k1 recoverable signatures (low-s normalized)
//! - Sender recovery and address derivation

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod hash;
mod signature;

pub use error::CryptoError;
pub use hash::keccak256;
pub use signature::{
    public_key_to_address, recover_address, sign, PrivateKey, PublicKey, Signature,
};

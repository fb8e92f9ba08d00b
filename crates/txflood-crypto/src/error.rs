//! Cryptographic errors

use thiserror::Error;

/// Cryptographic operation error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Signing failed
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// Signature scalars are out of range
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Recovery id was not 0 or 1
    #[error("invalid recovery id: {0}")]
    InvalidRecoveryId(u8),

    /// Public key recovery failed
    #[error("public key recovery failed: {0}")]
    RecoveryFailed(String),

    /// Private key bytes were rejected
    #[error("invalid private key")]
    InvalidPrivateKey,
}

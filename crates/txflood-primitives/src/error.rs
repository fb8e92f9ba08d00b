//! Errors raised while parsing primitive values

use thiserror::Error;

/// Primitive parsing error
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PrimitiveError {
    /// Input was not valid hex
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    /// Decoded byte length did not match the target type
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// Required length
        expected: usize,
        /// Length that was supplied
        got: usize,
    },

    /// Input was not a valid hex quantity
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
}

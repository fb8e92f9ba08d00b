//! RPC error types

use thiserror::Error;

/// RPC error type
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Transport/network error
    #[error("transport error: {0}")]
    Transport(String),

    /// Request did not complete in time
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// JSON-RPC error returned by the node
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// Error code
        code: i64,
        /// Error message
        message: String,
    },

    /// Response could not be deserialized
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Response deserialized but holds inconsistent data
    #[error("decode error: {0}")]
    Decode(String),

    /// Invalid endpoint configuration
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl RpcError {
    /// True if the node reports that it already holds the transaction.
    ///
    /// Geth says "already known", some other clients say "Known transaction".
    pub fn is_already_known(&self) -> bool {
        match self {
            RpcError::Rpc { message, .. } => {
                message.contains("already known") || message.contains("Known transaction")
            }
            _ => false,
        }
    }

    /// True if the node rejects the call as unsupported
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, RpcError::Rpc { code: -32601, .. })
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Serialization(e.to_string())
    }
}

impl From<txflood_primitives::PrimitiveError> for RpcError {
    fn from(e: txflood_primitives::PrimitiveError) -> Self {
        RpcError::Decode(e.to_string())
    }
}

impl From<txflood_crypto::CryptoError> for RpcError {
    fn from(e: txflood_crypto::CryptoError) -> Self {
        RpcError::Decode(e.to_string())
    }
}

/// Result alias for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

//! Pool error types

use thiserror::Error;
use txflood_crypto::CryptoError;
use txflood_rpc::RpcError;

/// Errors raised by the endpoint pool, accounts and the transaction pool
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// RPC call failed
    #[error("rpc: {0}")]
    Rpc(#[from] RpcError),

    /// Signing or sender recovery failed
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    /// No endpoint matched the selection filter
    #[error("no endpoint available")]
    NoEndpoint,

    /// Health probe left no usable endpoint
    #[error("no healthy endpoint")]
    NoHealthyEndpoint,

    /// Malformed rpchost string
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Malformed private key
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// Account has no chain id yet
    #[error("chain id not set for account {0}")]
    MissingChainId(String),

    /// Transaction could not be built
    #[error("transaction build error: {0}")]
    TxBuild(String),

    /// Operation did not complete in time
    #[error("timed out: {0}")]
    Timeout(String),

    /// Caller cancelled the wait
    #[error("cancelled")]
    Cancelled,

    /// Block body and receipt list disagree
    #[error("block {number}: {txs} transactions but {receipts} receipts")]
    ReceiptMismatch {
        /// Block number
        number: u64,
        /// Transactions in the body
        txs: usize,
        /// Receipts returned
        receipts: usize,
    },

    /// Endpoint does not have the block
    #[error("block {0} unavailable")]
    BlockUnavailable(u64),

    /// Every candidate endpoint rejected the transaction
    #[error("submission rejected by {endpoints} endpoint(s): {last}")]
    SubmissionFailed {
        /// Endpoints tried
        endpoints: usize,
        /// Last error seen
        last: RpcError,
    },

    /// Batch gave up after too many resubmissions
    #[error("retry budget exhausted after {0} retries")]
    RetryBudgetExhausted(usize),
}

impl PoolError {
    /// True for [`PoolError::Cancelled`]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PoolError::Cancelled)
    }

    /// True when a node reports it already holds the transaction
    pub fn is_already_known(&self) -> bool {
        match self {
            PoolError::Rpc(e) => e.is_already_known(),
            PoolError::SubmissionFailed { last, .. } => last.is_already_known(),
            _ => false,
        }
    }
}

/// Result alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

//! # txflood-rpc
//!
//! JSON-RPC access to a single node.
//!
//! - [`Transport`]: object-safe request trait, with [`HttpTransport`] and [`MockTransport`]
//! - [`RpcClient`]: typed wrappers for the calls the pool consumes
//! - [`types`]: wire representations of blocks, transactions and receipts

#![warn(missing_docs)]
#![warn(clippy::all)]

mod client;
mod error;
mod transport;
pub mod types;

pub use client::RpcClient;
pub use error::{RpcError, RpcResult};
pub use transport::{deserialize_response, MockTransport, Transport};
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use types::{BlockId, RpcBlock, RpcReceipt, RpcTransaction};

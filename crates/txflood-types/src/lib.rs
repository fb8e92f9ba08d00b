//! # txflood-types
//!
//! Chain data types consumed and produced by the transaction pool:
//! - [`SignedTransaction`] with EIP-2718 encoding, hashing and sender recovery
//! - [`Block`] as fetched from an endpoint
//! - [`Receipt`] as fetched from an endpoint

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod receipt;
pub mod transaction;

pub use block::{Block, BlockTransaction};
pub use receipt::{Receipt, TxStatus};
pub use transaction::{
    AccessListItem, DynamicFeeTx, LegacyTx, SignedTransaction, TransactionBody, TxType,
};

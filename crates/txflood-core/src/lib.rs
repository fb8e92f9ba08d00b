//! # txflood-core
//!
//! Transaction submission and tracking for load generation.
//!
//! ## Components
//!
//! - **EndpointPool**: health-probed RPC endpoints with group-aware selection
//! - **Account**: per-address nonce issuance, resolution handles and balance
//! - **TxPool**: block ingestion, reorg recovery, submission with rebroadcast, batches
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use txflood_core::{
//!     Account, EndpointPool, EndpointPoolConfig, SubmissionOptions, TxBuilder, TxPool,
//!     TxPoolConfig,
//! };
//! use txflood_primitives::Address;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EndpointPoolConfig {
//!         hosts: vec!["group(east)http://127.0.0.1:8545".into()],
//!         ..Default::default()
//!     };
//!     let endpoints = Arc::new(EndpointPool::from_config(config)?);
//!     let chain_id = endpoints.prepare().await?;
//!
//!     let cancel = CancellationToken::new();
//!     let pool = TxPool::new(endpoints.clone(), TxPoolConfig::default());
//!     pool.start(&cancel);
//!
//!     let account = Arc::new(Account::new_random());
//!     account.set_chain_id(chain_id);
//!     let account = pool.register_account(account);
//!
//!     let tx = account.build_transaction(
//!         &TxBuilder::transfer(Address::ZERO, 1)
//!             .max_fee_per_gas(20_000_000_000)
//!             .max_priority_fee_per_gas(1_000_000_000),
//!     )?;
//!     let receipt = pool
//!         .send_and_await(&account, tx, SubmissionOptions::new(), &cancel)
//!         .await?;
//!     println!("included: {:?}", receipt.map(|r| r.block_number));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod account;
pub mod config;
pub mod endpoint;
pub mod endpoint_pool;
mod error;
mod supervisor;
mod tx_builder;
pub mod txpool;

pub use account::{Account, PendingTx, ResolutionHandle, StaleSweep};
pub use config::{EndpointPoolConfig, TxPoolConfig};
pub use endpoint::{Endpoint, EndpointKind, ParsedHost, RequestStats};
pub use endpoint_pool::{EndpointPool, HealthReport, SelectionMode};
pub use error::{PoolError, PoolResult};
pub use supervisor::guarded;
pub use tx_builder::TxBuilder;
pub use txpool::{
    default_log_fn, BatchOptions, BatchProgress, BatchResult, BlockInfo, BlockStats,
    SubmissionOptions, TrackedTx, TxOutcome, TxPool,
};

//! Reorg-aware transaction pool
//!
//! The pool watches new blocks through the [`EndpointPool`], resolves the
//! nonces of registered [`Account`]s as their transactions get included,
//! and repairs account state when a reorg abandons blocks it already
//! processed.
//!
//! Tasks started by [`TxPool::start`]:
//! - the block loop, one block at a time
//! - the stale sweep, woken by the block loop after every advance
//!
//! Each submitted transaction additionally gets a confirmation watcher and,
//! if requested, a rebroadcaster sharing one cancellation token.

mod batch;
mod blocks;
mod reorg;
mod stale;
mod submit;

pub use batch::{BatchOptions, BatchProgress, BatchResult, ProgressFn};
pub use submit::{
    default_log_fn, CompleteFn, ConfirmFn, EncodeFn, LogFn, RebroadcastFn, SubmissionOptions,
    TxOutcome,
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use txflood_primitives::{Address, H256, U256};
use txflood_types::SignedTransaction;

use crate::account::{Account, PendingTx};
use crate::config::TxPoolConfig;
use crate::endpoint_pool::EndpointPool;

/// Header fields of a processed block kept for reorg detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block number
    pub number: u64,
    /// Block hash
    pub hash: H256,
    /// Parent hash
    pub parent_hash: H256,
    /// Unix timestamp
    pub timestamp: u64,
    /// Gas limit
    pub gas_limit: u64,
}

/// An included transaction that touched a registered account
#[derive(Debug, Clone)]
pub struct TrackedTx {
    /// Transaction hash
    pub hash: H256,
    /// Block it was included in
    pub block_number: u64,
    /// Sender
    pub from: Address,
    /// Recipient
    pub to: Option<Address>,
    /// Sender nonce
    pub nonce: u64,
    /// Transferred value
    pub value: U256,
    /// Fee paid, from the receipt
    pub fee: U256,
    /// Decoded transaction, if the envelope is supported
    pub tx: Option<Arc<SignedTransaction>>,
    /// Submission record, if it went through this pool
    pub pending: Option<PendingTx>,
    /// Sender is a registered account
    pub sender_tracked: bool,
    /// Recipient is a registered account
    pub recipient_tracked: bool,
}

/// Per-block statistics published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStats {
    /// Block number
    pub number: u64,
    /// Transactions in the block
    pub tx_count: usize,
    /// Transactions touching registered accounts
    pub tracked_txs: usize,
    /// Transactions sent by registered accounts
    pub confirmed: usize,
    /// Registered senders with a transaction in the block
    pub affected_accounts: usize,
    /// Base fee of the block
    pub base_fee: Option<u128>,
    /// Gas limit of the block
    pub gas_limit: u64,
}

#[derive(Default)]
struct ChainCache {
    blocks: BTreeMap<u64, BlockInfo>,
    tracked: BTreeMap<u64, Vec<TrackedTx>>,
}

#[derive(Default, Clone, Copy)]
struct ChainHead {
    gas_limit: u64,
    base_fee: Option<u128>,
}

/// Transaction pool bound to one endpoint pool
pub struct TxPool {
    config: TxPoolConfig,
    endpoints: Arc<EndpointPool>,
    accounts: DashMap<Address, Arc<Account>>,
    cache: Mutex<ChainCache>,
    head: RwLock<ChainHead>,
    last_processed: AtomicU64,
    stale_notify: watch::Sender<u64>,
    block_events: broadcast::Sender<BlockStats>,
    shutdown: CancellationToken,
}

impl TxPool {
    /// Create a pool; nothing runs until [`TxPool::start`]
    pub fn new(endpoints: Arc<EndpointPool>, config: TxPoolConfig) -> Arc<Self> {
        let (stale_notify, _) = watch::channel(0);
        let (block_events, _) = broadcast::channel(config.subscription_capacity.max(1));
        Arc::new(Self {
            config,
            endpoints,
            accounts: DashMap::new(),
            cache: Mutex::new(ChainCache::default()),
            head: RwLock::new(ChainHead::default()),
            last_processed: AtomicU64::new(0),
            stale_notify,
            block_events,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the block loop and the stale sweep; both stop when `cancel`
    /// fires or the pool shuts down
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let shutdown = self.shutdown.clone();
        let cancel = cancel.clone();
        let stop = CancellationToken::new();
        {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = shutdown.cancelled() => {}
                }
                stop.cancel();
            });
        }
        let heights = self.stale_notify.subscribe();
        vec![
            tokio::spawn(self.clone().run_block_loop(stop.clone())),
            tokio::spawn(self.clone().run_stale_loop(heights, stop)),
        ]
    }

    /// Stop background loops and pool-initiated resubmissions
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Pool configuration
    pub fn config(&self) -> &TxPoolConfig {
        &self.config
    }

    /// The endpoint pool used for reads and submissions
    pub fn endpoints(&self) -> &Arc<EndpointPool> {
        &self.endpoints
    }

    // ==================== Accounts ====================

    /// Track an account; returns the instance already tracked for the same address
    pub fn register_account(&self, account: Arc<Account>) -> Arc<Account> {
        self.accounts
            .entry(account.address())
            .or_insert(account)
            .value()
            .clone()
    }

    /// Tracked account by address
    pub fn account(&self, address: &Address) -> Option<Arc<Account>> {
        self.accounts.get(address).map(|a| a.value().clone())
    }

    /// Snapshot of every tracked account
    pub fn accounts(&self) -> Vec<Arc<Account>> {
        self.accounts.iter().map(|a| a.value().clone()).collect()
    }

    // ==================== Chain view ====================

    /// Highest block processed so far
    pub fn last_processed_block(&self) -> u64 {
        self.last_processed.load(Ordering::Acquire)
    }

    /// Gas limit of the last processed block
    pub fn current_gas_limit(&self) -> u64 {
        self.head.read().gas_limit
    }

    /// Base fee of the last processed block
    pub fn current_base_fee(&self) -> Option<u128> {
        self.head.read().base_fee
    }

    /// Cached header at `number`, if still inside the reorg window
    pub fn block_info(&self, number: u64) -> Option<BlockInfo> {
        self.cache.lock().blocks.get(&number).copied()
    }

    /// Tracked transactions included at `number`
    pub fn tracked_txs(&self, number: u64) -> Vec<TrackedTx> {
        self.cache
            .lock()
            .tracked
            .get(&number)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a transaction is recorded as included within the reorg window
    pub fn is_tracked(&self, hash: &H256) -> bool {
        self.cache
            .lock()
            .tracked
            .values()
            .flatten()
            .any(|t| t.hash == *hash)
    }

    /// Per-block statistics stream
    pub fn subscribe(&self) -> broadcast::Receiver<BlockStats> {
        self.block_events.subscribe()
    }
}

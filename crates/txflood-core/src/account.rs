//! Per-address nonce and balance state with confirmation signalling
//!
//! Three independent critical sections:
//! - the nonce counter (`pending_nonce` atomic plus the skipped-nonce set)
//! - the resolution registry (`book`), keyed by nonce
//! - the balance
//!
//! None of them is held while another is taken, and none across an `.await`.

use bytes::Bytes;
use futures::future::{FutureExt, Shared};
use k256::ecdsa::SigningKey;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use txflood_crypto::{public_key_to_address, sign};
use txflood_primitives::{Address, H256, U256};
use txflood_types::{DynamicFeeTx, Receipt, SignedTransaction, TransactionBody};
use zeroize::Zeroizing;

use crate::endpoint::Endpoint;
use crate::endpoint_pool::{EndpointPool, SelectionMode};
use crate::tx_builder::TxBuilder;
use crate::{PoolError, PoolResult};

/// Pending-nonce slots past the on-chain nonce considered for stale rebroadcast
const STALE_REBROADCAST_SLOTS: u64 = 2;

// ==================== Resolution handles ====================

type ReceiptSlot = Shared<oneshot::Receiver<Option<Receipt>>>;

/// Awaitable outcome of one nonce: the receipt of the transaction that
/// used it, or nothing if the slot was closed without one.
#[derive(Clone)]
pub struct ResolutionHandle {
    nonce: u64,
    slot: ReceiptSlot,
}

impl ResolutionHandle {
    /// Nonce this handle tracks
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Wait for resolution
    pub async fn wait(self) -> Option<Receipt> {
        self.slot.await.ok().flatten()
    }

    /// Outcome if already resolved
    pub fn peek(&self) -> Option<Option<Receipt>> {
        self.slot.peek().map(|r| r.clone().ok().flatten())
    }
}

impl fmt::Debug for ResolutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionHandle")
            .field("nonce", &self.nonce)
            .field("resolved", &self.slot.peek().is_some())
            .finish()
    }
}

/// A submitted transaction waiting on its nonce
#[derive(Clone, Debug)]
pub struct PendingTx {
    /// The transaction
    pub tx: Arc<SignedTransaction>,
    /// Wire bytes to resubmit, if not the default encoding
    pub raw: Option<Bytes>,
    /// Whether stale sweeps may rebroadcast it
    pub rebroadcast: bool,
    /// Endpoint group used for rebroadcasts
    pub group: String,
    /// First submission
    pub submitted: Instant,
    /// Last rebroadcast, or first submission
    pub last_rebroadcast: Instant,
    /// Rebroadcasts so far
    pub rebroadcast_count: u32,
}

impl PendingTx {
    /// Track a freshly submitted transaction
    pub fn new(tx: Arc<SignedTransaction>, raw: Option<Bytes>, rebroadcast: bool, group: &str) -> Self {
        let now = Instant::now();
        Self {
            tx,
            raw,
            rebroadcast,
            group: group.to_string(),
            submitted: now,
            last_rebroadcast: now,
            rebroadcast_count: 0,
        }
    }

    /// Bytes to submit
    pub fn wire_bytes(&self) -> Bytes {
        self.raw.clone().unwrap_or_else(|| self.tx.encode())
    }
}

struct NonceSlot {
    sender: Option<oneshot::Sender<Option<Receipt>>>,
    receipt: Option<Receipt>,
    slot: ReceiptSlot,
    txs: Vec<PendingTx>,
}

impl NonceSlot {
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: Some(sender),
            receipt: None,
            slot: receiver.shared(),
            txs: Vec::new(),
        }
    }

    fn close(mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(self.receipt.take());
        }
    }
}

#[derive(Default)]
struct NonceBook {
    confirmed_nonce: u64,
    last_confirmation_height: u64,
    slots: BTreeMap<u64, NonceSlot>,
}

impl NonceBook {
    /// Remove and return every slot below `nonce`
    fn take_below(&mut self, nonce: u64) -> BTreeMap<u64, NonceSlot> {
        let rest = self.slots.split_off(&nonce);
        std::mem::replace(&mut self.slots, rest)
    }
}

/// Result of closing stale nonces against the on-chain nonce
#[derive(Debug, Default)]
pub struct StaleSweep {
    /// Nonces closed without receipt
    pub closed: Vec<u64>,
    /// Nonces between the on-chain nonce and the lowest pending one
    pub gaps: Vec<u64>,
    /// Transactions due for a rebroadcast, counters already advanced
    pub rebroadcast: Vec<PendingTx>,
}

// ==================== Account ====================

/// A signing account with locally tracked nonce and balance
pub struct Account {
    address: Address,
    key: SigningKey,
    chain_id: AtomicU64,
    pending_nonce: AtomicU64,
    skipped: Mutex<BTreeSet<u64>>,
    book: Mutex<NonceBook>,
    balance: RwLock<U256>,
    submitted: AtomicU64,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .field("pending_nonce", &self.pending_nonce())
            .finish_non_exhaustive()
    }
}

impl Account {
    /// Wrap a signing key
    pub fn new(key: SigningKey) -> Self {
        let address = public_key_to_address(key.verifying_key());
        Self {
            address,
            key,
            chain_id: AtomicU64::new(0),
            pending_nonce: AtomicU64::new(0),
            skipped: Mutex::new(BTreeSet::new()),
            book: Mutex::new(NonceBook::default()),
            balance: RwLock::new(U256::zero()),
            submitted: AtomicU64::new(0),
        }
    }

    /// Generate a fresh random key
    pub fn new_random() -> Self {
        Self::new(SigningKey::random(&mut OsRng))
    }

    /// Load a hex-encoded private key, with or without `0x`
    pub fn from_private_key_hex(hex_key: &str) -> PoolResult<Self> {
        let hex_key = hex_key.trim();
        let hex_key = hex_key.strip_prefix("0x").unwrap_or(hex_key);
        let bytes = Zeroizing::new(
            hex::decode(hex_key).map_err(|e| PoolError::InvalidKey(e.to_string()))?,
        );
        if bytes.len() != 32 {
            return Err(PoolError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let key = SigningKey::from_slice(&bytes).map_err(|e| PoolError::InvalidKey(e.to_string()))?;
        Ok(Self::new(key))
    }

    /// Account address
    pub fn address(&self) -> Address {
        self.address
    }

    /// Chain id, `None` until set
    pub fn chain_id(&self) -> Option<u64> {
        match self.chain_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Set the chain id used for signing
    pub fn set_chain_id(&self, chain_id: u64) {
        self.chain_id.store(chain_id, Ordering::Release);
    }

    // ==================== Nonces ====================

    /// Next nonce that will be handed out
    pub fn pending_nonce(&self) -> u64 {
        self.pending_nonce.load(Ordering::Acquire)
    }

    /// Highest resolved nonce + 1
    pub fn confirmed_nonce(&self) -> u64 {
        self.book.lock().confirmed_nonce
    }

    /// Height of the last confirmation seen for this account
    pub fn last_confirmation_height(&self) -> u64 {
        self.book.lock().last_confirmation_height
    }

    /// Hand out a nonce, reusing released ones first
    pub fn next_nonce(&self) -> u64 {
        let confirmed = self.confirmed_nonce();
        loop {
            let Some(nonce) = self.skipped.lock().pop_first() else {
                break;
            };
            if nonce >= confirmed {
                info!(account = %self.address, nonce, "reusing skipped nonce");
                return nonce;
            }
        }
        self.pending_nonce.fetch_add(1, Ordering::AcqRel)
    }

    /// Give back a nonce whose transaction was never submitted.
    ///
    /// Rolls the counter back if it was the last one issued, otherwise
    /// queues it for reuse.
    pub fn release_nonce(&self, nonce: u64) {
        if self
            .pending_nonce
            .compare_exchange(nonce + 1, nonce, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped.lock().insert(nonce);
        }
    }

    /// Adopt a nonce read from the chain: both counters move up to it,
    /// handles below it close without receipt
    pub fn sync_nonce(&self, nonce: u64) {
        self.pending_nonce.fetch_max(nonce, Ordering::AcqRel);
        let closed = {
            let mut book = self.book.lock();
            book.confirmed_nonce = book.confirmed_nonce.max(nonce);
            let confirmed = book.confirmed_nonce;
            book.take_below(confirmed)
        };
        closed.into_values().for_each(NonceSlot::close);
    }

    /// Refresh chain id (if unset), confirmed nonce and balance from an endpoint
    pub async fn update_from_chain(&self, endpoint: &Endpoint) -> PoolResult<()> {
        if self.chain_id().is_none() {
            self.set_chain_id(endpoint.chain_id().await?);
        }
        let nonce = endpoint.nonce_at(&self.address).await?;
        self.sync_nonce(nonce);
        let balance = endpoint.balance(&self.address).await?;
        self.set_balance(balance);
        debug!(account = %self.address, nonce, %balance, "account synced");
        Ok(())
    }

    // ==================== Resolution registry ====================

    /// Handle for `nonce`, registering `pending` with it.
    ///
    /// Returns `(None, false)` if the nonce already resolved. The flag is
    /// true when this created the only outstanding slot of the account.
    pub fn resolution_handle(
        &self,
        nonce: u64,
        pending: Option<PendingTx>,
    ) -> (Option<ResolutionHandle>, bool) {
        let mut book = self.book.lock();
        if nonce < book.confirmed_nonce {
            return (None, false);
        }
        let created = !book.slots.contains_key(&nonce);
        let slot = book.slots.entry(nonce).or_insert_with(NonceSlot::new);
        if let Some(pending) = pending {
            if !slot.txs.iter().any(|p| p.tx.hash() == pending.tx.hash()) {
                slot.txs.push(pending);
            }
        }
        let handle = ResolutionHandle {
            nonce,
            slot: slot.slot.clone(),
        };
        let is_first = created && book.slots.len() == 1;
        (Some(handle), is_first)
    }

    /// Seed the confirmation height when the first slot opens after a quiet period
    pub fn note_first_pending(&self, last_block: u64) {
        let mut book = self.book.lock();
        if last_block > book.last_confirmation_height + 1 {
            book.last_confirmation_height = last_block - 1;
        }
    }

    /// Record the inclusion of this account's transaction with `nonce`.
    ///
    /// The slot for `nonce` receives the receipt and every slot at or
    /// below it closes.
    pub fn resolve(&self, height: u64, nonce: u64, receipt: Receipt) {
        let closed = {
            let mut book = self.book.lock();
            if let Some(slot) = book.slots.get_mut(&nonce) {
                slot.receipt = Some(receipt);
            }
            book.confirmed_nonce = book.confirmed_nonce.max(nonce + 1);
            book.last_confirmation_height = book.last_confirmation_height.max(height);
            book.take_below(nonce + 1)
        };
        self.pending_nonce.fetch_max(nonce + 1, Ordering::AcqRel);
        closed.into_values().for_each(NonceSlot::close);
    }

    /// Rewind the confirmed nonce to an abandoned one.
    ///
    /// Only moves backward; returns whether it moved.
    pub fn reopen_from(&self, nonce: u64) -> bool {
        let mut book = self.book.lock();
        if nonce < book.confirmed_nonce {
            debug!(account = %self.address, from = book.confirmed_nonce, to = nonce, "confirmed nonce rewound");
            book.confirmed_nonce = nonce;
            true
        } else {
            false
        }
    }

    /// Forget a transaction whose submission failed
    pub fn drop_pending_tx(&self, tx: &SignedTransaction) {
        let mut book = self.book.lock();
        if let Some(slot) = book.slots.get_mut(&tx.nonce()) {
            slot.txs.retain(|p| p.tx.hash() != tx.hash());
        }
    }

    /// Submission record of a pending transaction
    pub fn pending_tx(&self, nonce: u64, hash: &H256) -> Option<PendingTx> {
        self.book
            .lock()
            .slots
            .get(&nonce)
            .and_then(|slot| slot.txs.iter().find(|p| p.tx.hash() == *hash).cloned())
    }

    /// Pending transactions in nonce order
    pub fn pending_txs(&self) -> Vec<PendingTx> {
        self.book
            .lock()
            .slots
            .values()
            .flat_map(|slot| slot.txs.iter().cloned())
            .collect()
    }

    /// Nonces with an open slot
    pub fn open_nonces(&self) -> Vec<u64> {
        self.book.lock().slots.keys().copied().collect()
    }

    // ==================== Stale sweep ====================

    /// True when slots are open and no confirmation arrived for more than
    /// `threshold` blocks; arms the next check `threshold` blocks later
    pub fn needs_stale_sweep(&self, height: u64, threshold: u64) -> bool {
        let mut book = self.book.lock();
        if book.slots.is_empty() || height <= book.last_confirmation_height + threshold {
            return false;
        }
        book.last_confirmation_height = height;
        true
    }

    /// Close every slot below `onchain_nonce`, report gaps and pick the
    /// lowest pending transactions whose rebroadcast is `due`
    pub fn close_stale<F>(&self, onchain_nonce: u64, due: F) -> StaleSweep
    where
        F: Fn(&PendingTx) -> bool,
    {
        let mut sweep = StaleSweep::default();
        let closed = {
            let mut book = self.book.lock();
            let lowest_pending = book
                .slots
                .iter()
                .find(|(_, slot)| !slot.txs.is_empty())
                .map(|(nonce, _)| *nonce);

            for (nonce, slot) in book.slots.range_mut(onchain_nonce..) {
                if *nonce >= onchain_nonce + STALE_REBROADCAST_SLOTS {
                    break;
                }
                if let Some(latest) = slot.txs.last_mut() {
                    if latest.rebroadcast && due(latest) {
                        latest.rebroadcast_count += 1;
                        latest.last_rebroadcast = Instant::now();
                        sweep.rebroadcast.push(latest.clone());
                    }
                }
            }

            book.confirmed_nonce = book.confirmed_nonce.max(onchain_nonce);
            if let Some(lowest) = lowest_pending {
                sweep.gaps = (onchain_nonce..lowest).collect();
            }
            book.take_below(onchain_nonce)
        };
        self.pending_nonce.fetch_max(onchain_nonce, Ordering::AcqRel);

        sweep.closed = closed.keys().copied().collect();
        closed.into_values().for_each(NonceSlot::close);
        sweep
    }

    /// Read the on-chain nonce at `height` from random endpoints and close stale slots
    pub async fn sweep_stale<F>(
        &self,
        pool: &EndpointPool,
        height: u64,
        retries: u32,
        due: F,
    ) -> PoolResult<StaleSweep>
    where
        F: Fn(&PendingTx) -> bool,
    {
        let mut last_error = PoolError::NoEndpoint;
        for _ in 0..retries.max(1) {
            let Some(endpoint) = pool.select(SelectionMode::Random, "*", &[]) else {
                continue;
            };
            match endpoint.nonce_at_height(&self.address, height).await {
                Ok(onchain) => {
                    let sweep = self.close_stale(onchain, due);
                    if !sweep.closed.is_empty() {
                        debug!(account = %self.address, onchain, closed = sweep.closed.len(), "recovered stale confirmations");
                    }
                    return Ok(sweep);
                }
                Err(e) => last_error = e,
            }
        }
        warn!(account = %self.address, error = %last_error, "could not read on-chain nonce");
        Err(last_error)
    }

    // ==================== Balance ====================

    /// Tracked balance
    pub fn balance(&self) -> U256 {
        *self.balance.read()
    }

    /// Overwrite the tracked balance
    pub fn set_balance(&self, balance: U256) {
        *self.balance.write() = balance;
    }

    /// Credit received value
    pub fn add_balance(&self, amount: U256) {
        let mut balance = self.balance.write();
        *balance = balance.saturating_add(amount);
    }

    /// Debit spent value and fees, floored at zero
    pub fn sub_balance(&self, amount: U256) {
        let mut balance = self.balance.write();
        *balance = balance.saturating_sub(amount);
    }

    // ==================== Signing ====================

    /// Sign an unsigned body as is
    pub fn sign(&self, body: TransactionBody) -> PoolResult<SignedTransaction> {
        let signature = sign(&body.signing_hash(), &self.key)?;
        Ok(body.into_signed(signature))
    }

    /// Build and sign with a fresh nonce; the nonce is released on failure
    pub fn build_transaction(&self, builder: &TxBuilder) -> PoolResult<SignedTransaction> {
        let chain_id = self
            .chain_id()
            .ok_or_else(|| PoolError::MissingChainId(self.address.to_hex()))?;
        let nonce = self.next_nonce();
        match builder.build(nonce, chain_id).and_then(|body| self.sign(body)) {
            Ok(tx) => Ok(tx),
            Err(e) => {
                self.release_nonce(nonce);
                Err(e)
            }
        }
    }

    /// Zero-value self-transfer at an explicit nonce, used to close nonce gaps
    pub fn build_filler_tx(
        &self,
        nonce: u64,
        tip: u128,
        fee_cap: u128,
    ) -> PoolResult<SignedTransaction> {
        let chain_id = self
            .chain_id()
            .ok_or_else(|| PoolError::MissingChainId(self.address.to_hex()))?;
        self.sign(TransactionBody::DynamicFee(DynamicFeeTx {
            chain_id,
            nonce,
            max_priority_fee_per_gas: tip.min(fee_cap),
            max_fee_per_gas: fee_cap,
            gas_limit: 21_000,
            to: Some(self.address),
            value: 0,
            data: Bytes::new(),
            access_list: Vec::new(),
        }))
    }

    /// Transactions submitted through the pool
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub(crate) fn note_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }
}

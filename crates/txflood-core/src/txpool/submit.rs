//! Submission, confirmation watching and rebroadcast

use bytes::Bytes;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use txflood_primitives::H256;
use txflood_types::{Receipt, SignedTransaction};

use super::TxPool;
use crate::account::{Account, PendingTx, ResolutionHandle};
use crate::endpoint::Endpoint;
use crate::endpoint_pool::SelectionMode;
use crate::{PoolError, PoolResult};

/// Endpoints that must accept the initial submission when not configured
const DEFAULT_SUBMIT_COUNT: usize = 3;

/// Endpoints tried per rebroadcast round
const MAX_REBROADCAST_ENDPOINTS: usize = 5;

/// Called with the receipt once the transaction is included
pub type ConfirmFn = Arc<dyn Fn(&SignedTransaction, &Receipt) + Send + Sync>;
/// Called exactly once when tracking of the transaction ends
pub type CompleteFn =
    Arc<dyn Fn(&SignedTransaction, Option<&Receipt>, Option<&PoolError>) + Send + Sync>;
/// Called after every submission attempt: endpoint, retry index, rebroadcast round, error
pub type LogFn = Arc<dyn Fn(&Endpoint, usize, u32, Option<&PoolError>) + Send + Sync>;
/// Called before every rebroadcast attempt
pub type RebroadcastFn =
    Arc<dyn Fn(&SignedTransaction, &SubmissionOptions, &Endpoint) + Send + Sync>;
/// Produces the wire bytes to submit; `None` uses the default encoding
pub type EncodeFn = Arc<dyn Fn(&SignedTransaction) -> PoolResult<Option<Bytes>> + Send + Sync>;

/// How a transaction is submitted and tracked
#[derive(Clone, Default)]
pub struct SubmissionOptions {
    /// Endpoint tried first
    pub endpoint: Option<Arc<Endpoint>>,
    /// Endpoint group for selection, `""` for the default group
    pub group: String,
    /// Offset added to the selection index
    pub start_offset: usize,
    /// Endpoints that must accept before submission stops, 0 for the default of 3
    pub submit_count: usize,
    /// Allow the stale sweep to rebroadcast the transaction
    pub rebroadcast: bool,
    /// Interval of the per-transaction rebroadcaster
    pub rebroadcast_interval: Option<Duration>,
    /// Rebroadcast rounds before the rebroadcaster gives up
    pub max_rebroadcasts: u32,
    /// Confirmation callback
    pub on_confirm: Option<ConfirmFn>,
    /// Completion callback
    pub on_complete: Option<CompleteFn>,
    /// Submission attempt logger, [`default_log_fn`] behaviour when unset
    pub on_log: Option<LogFn>,
    /// Rebroadcast hook
    pub on_rebroadcast: Option<RebroadcastFn>,
    /// Custom encoding
    pub on_encode: Option<EncodeFn>,
}

impl fmt::Debug for SubmissionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionOptions")
            .field("endpoint", &self.endpoint.as_ref().map(|e| e.name()))
            .field("group", &self.group)
            .field("start_offset", &self.start_offset)
            .field("submit_count", &self.submit_count)
            .field("rebroadcast", &self.rebroadcast)
            .field("rebroadcast_interval", &self.rebroadcast_interval)
            .field("max_rebroadcasts", &self.max_rebroadcasts)
            .finish_non_exhaustive()
    }
}

impl SubmissionOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Try this endpoint first
    pub fn endpoint(mut self, endpoint: Arc<Endpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Select endpoints from this group
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Endpoints that must accept the initial submission
    pub fn submit_count(mut self, count: usize) -> Self {
        self.submit_count = count;
        self
    }

    /// Let the stale sweep rebroadcast this transaction
    pub fn rebroadcast(mut self, enabled: bool) -> Self {
        self.rebroadcast = enabled;
        self
    }

    /// Rebroadcast every `interval`, at most `max` times
    pub fn rebroadcast_every(mut self, interval: Duration, max: u32) -> Self {
        self.rebroadcast_interval = Some(interval);
        self.max_rebroadcasts = max;
        self
    }

    /// Set the confirmation callback
    pub fn on_confirm<F>(mut self, f: F) -> Self
    where
        F: Fn(&SignedTransaction, &Receipt) + Send + Sync + 'static,
    {
        self.on_confirm = Some(Arc::new(f));
        self
    }

    /// Set the completion callback
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&SignedTransaction, Option<&Receipt>, Option<&PoolError>) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }

    /// Set the submission logger
    pub fn on_log<F>(mut self, f: F) -> Self
    where
        F: Fn(&Endpoint, usize, u32, Option<&PoolError>) + Send + Sync + 'static,
    {
        self.on_log = Some(Arc::new(f));
        self
    }

    /// Set the rebroadcast hook
    pub fn on_rebroadcast<F>(mut self, f: F) -> Self
    where
        F: Fn(&SignedTransaction, &SubmissionOptions, &Endpoint) + Send + Sync + 'static,
    {
        self.on_rebroadcast = Some(Arc::new(f));
        self
    }

    /// Set the custom encoder
    pub fn on_encode<F>(mut self, f: F) -> Self
    where
        F: Fn(&SignedTransaction) -> PoolResult<Option<Bytes>> + Send + Sync + 'static,
    {
        self.on_encode = Some(Arc::new(f));
        self
    }

    fn log(
        &self,
        tx: &SignedTransaction,
        endpoint: &Endpoint,
        retry: usize,
        rebroadcast: u32,
        error: Option<&PoolError>,
    ) {
        match &self.on_log {
            Some(log) => log(endpoint, retry, rebroadcast, error),
            None => log_attempt("", tx.nonce(), endpoint, retry, rebroadcast, error),
        }
    }
}

/// Logger that reports retries, rebroadcasts and failures at debug level
pub fn default_log_fn(label: impl Into<String>, tx: &SignedTransaction) -> LogFn {
    let label = label.into();
    let nonce = tx.nonce();
    Arc::new(move |endpoint, retry, rebroadcast, error| {
        log_attempt(&label, nonce, endpoint, retry, rebroadcast, error)
    })
}

fn log_attempt(
    label: &str,
    nonce: u64,
    endpoint: &Endpoint,
    retry: usize,
    rebroadcast: u32,
    error: Option<&PoolError>,
) {
    let endpoint = endpoint.name();
    match error {
        Some(e) => debug!(%endpoint, nonce, retry, rebroadcast, label, error = %e, "failed sending tx"),
        None if retry > 0 || rebroadcast > 0 => {
            debug!(%endpoint, nonce, retry, rebroadcast, label, "successfully sent tx")
        }
        None => {}
    }
}

/// Final state of a tracked transaction
#[derive(Debug, Clone)]
pub struct TxOutcome {
    /// Receipt of this exact transaction, if it was included
    pub receipt: Option<Receipt>,
    /// Submission failure or cancellation
    pub error: Option<PoolError>,
}

impl TxOutcome {
    fn into_result(self) -> PoolResult<Option<Receipt>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.receipt),
        }
    }
}

async fn send_to(endpoint: &Endpoint, tx: &SignedTransaction, raw: Option<&[u8]>) -> PoolResult<()> {
    match raw {
        Some(raw) => endpoint.send_raw(raw).await,
        None => endpoint.send_transaction(tx).await,
    }
}

impl TxPool {
    // ==================== Public API ====================

    /// Submit a transaction and track it in the background.
    ///
    /// Returns once the initial submission settled; an error means every
    /// candidate endpoint rejected it. Confirmation is reported through the
    /// option callbacks.
    pub async fn send(
        self: &Arc<Self>,
        account: &Arc<Account>,
        tx: SignedTransaction,
        options: SubmissionOptions,
        cancel: &CancellationToken,
    ) -> PoolResult<()> {
        self.submit(account, Arc::new(tx), options, cancel.clone(), true)
            .await
            .map(|_| ())
    }

    /// Submit and wait for the outcome.
    ///
    /// `Ok(None)` means the nonce was used by another transaction or no
    /// receipt could be found.
    pub async fn send_and_await(
        self: &Arc<Self>,
        account: &Arc<Account>,
        tx: SignedTransaction,
        options: SubmissionOptions,
        cancel: &CancellationToken,
    ) -> PoolResult<Option<Receipt>> {
        let outcome = self
            .submit(account, Arc::new(tx), options, cancel.clone(), true)
            .await?;
        outcome
            .await
            .map_err(|_| PoolError::Cancelled)
            .and_then(TxOutcome::into_result)
    }

    /// Submit transactions in order, then wait for all of them.
    ///
    /// Stops at the first rejected submission and returns its error.
    pub async fn send_and_await_range(
        self: &Arc<Self>,
        account: &Arc<Account>,
        txs: Vec<SignedTransaction>,
        options: SubmissionOptions,
        cancel: &CancellationToken,
    ) -> PoolResult<Vec<Option<Receipt>>> {
        let mut outcomes = Vec::with_capacity(txs.len());
        for tx in txs {
            let outcome = self
                .submit(account, Arc::new(tx), options.clone(), cancel.clone(), true)
                .await?;
            outcomes.push(outcome);
        }
        join_all(outcomes)
            .await
            .into_iter()
            .map(|outcome| {
                outcome
                    .map_err(|_| PoolError::Cancelled)
                    .and_then(TxOutcome::into_result)
            })
            .collect()
    }

    /// Wait for a transaction submitted elsewhere
    pub async fn await_transaction(
        &self,
        account: &Account,
        tx: &SignedTransaction,
        cancel: &CancellationToken,
    ) -> PoolResult<Option<Receipt>> {
        let (handle, is_first) = account.resolution_handle(tx.nonce(), None);
        if is_first {
            account.note_first_pending(self.last_processed_block());
        }
        self.await_resolution(tx.hash(), handle, cancel).await
    }

    // ==================== Internals ====================

    /// Register the watcher, then submit unless `submit_now` is false.
    ///
    /// The receiver yields the outcome after the completion callback ran.
    pub(super) async fn submit(
        self: &Arc<Self>,
        account: &Arc<Account>,
        tx: Arc<SignedTransaction>,
        options: SubmissionOptions,
        cancel: CancellationToken,
        submit_now: bool,
    ) -> PoolResult<oneshot::Receiver<TxOutcome>> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let account = self.register_account(account.clone());
        let raw = match &options.on_encode {
            Some(encode) => encode(&tx)?.filter(|raw| !raw.is_empty()),
            None => None,
        };

        let pending = PendingTx::new(tx.clone(), raw.clone(), options.rebroadcast, &options.group);
        let (handle, is_first) = account.resolution_handle(tx.nonce(), Some(pending));
        if is_first {
            account.note_first_pending(self.last_processed_block());
        }

        let confirm = cancel.child_token();
        let (submitted_tx, submitted_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(self.clone().watch_confirmation(
            tx.clone(),
            handle,
            options.clone(),
            confirm.clone(),
            submitted_rx,
            outcome_tx,
        ));

        let result = if submit_now {
            self.submit_to_endpoints(&tx, raw.as_deref(), &options).await
        } else {
            Ok(())
        };

        match &result {
            Ok(()) => {
                if submit_now {
                    account.note_submitted();
                }
                if let Some(interval) = options.rebroadcast_interval {
                    if options.max_rebroadcasts > 0 {
                        tokio::spawn(self.clone().run_rebroadcaster(
                            tx.clone(),
                            raw,
                            options,
                            interval,
                            confirm.clone(),
                        ));
                    }
                }
            }
            Err(_) => {
                account.drop_pending_tx(&tx);
                confirm.cancel();
            }
        }
        let _ = submitted_tx.send(result.as_ref().err().cloned());
        result.map(|_| outcome_rx)
    }

    async fn watch_confirmation(
        self: Arc<Self>,
        tx: Arc<SignedTransaction>,
        handle: Option<ResolutionHandle>,
        options: SubmissionOptions,
        confirm: CancellationToken,
        submitted: oneshot::Receiver<Option<PoolError>>,
        outcome: oneshot::Sender<TxOutcome>,
    ) {
        let waited = self.await_resolution(tx.hash(), handle, &confirm).await;
        confirm.cancel();

        let (receipt, error) = match submitted.await.unwrap_or(None) {
            Some(e) => (None, Some(e)),
            None => match waited {
                Ok(receipt) => (receipt, None),
                Err(e) => (None, Some(e)),
            },
        };

        if let (Some(on_confirm), Some(receipt)) = (&options.on_confirm, &receipt) {
            on_confirm(&tx, receipt);
        }
        if let Some(on_complete) = &options.on_complete {
            on_complete(&tx, receipt.as_ref(), error.as_ref());
        }
        let _ = outcome.send(TxOutcome { receipt, error });
    }

    /// Wait on the nonce handle, falling back to receipt polling when no
    /// handle applies or it closed without a receipt
    pub(super) async fn await_resolution(
        &self,
        hash: H256,
        handle: Option<ResolutionHandle>,
        cancel: &CancellationToken,
    ) -> PoolResult<Option<Receipt>> {
        if let Some(handle) = handle {
            let resolved = tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                resolved = handle.wait() => resolved,
            };
            if let Some(receipt) = resolved {
                return Ok((receipt.transaction_hash == hash).then_some(receipt));
            }
        }
        self.poll_receipt(hash, cancel).await
    }

    async fn poll_receipt(&self, hash: H256, cancel: &CancellationToken) -> PoolResult<Option<Receipt>> {
        let retries = self.config.receipt_poll_retries;
        for attempt in 0..=retries {
            let Some(endpoint) = self.endpoints.any() else {
                return Ok(None);
            };
            match tokio::time::timeout(self.config.fetch_timeout(), endpoint.receipt(&hash)).await {
                Ok(Ok(Some(receipt))) => return Ok(Some(receipt)),
                Ok(Ok(None)) => {}
                Ok(Err(e)) if attempt > 2 => {
                    warn!(endpoint = %endpoint.name(), tx = %hash, error = %e, "could not load tx receipt")
                }
                _ => {}
            }
            if attempt == retries {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = tokio::time::sleep(self.config.receipt_poll_delay()) => {}
            }
        }
        Ok(None)
    }

    /// Submit sequentially to candidate endpoints until enough accepted
    async fn submit_to_endpoints(
        &self,
        tx: &SignedTransaction,
        raw: Option<&[u8]>,
        options: &SubmissionOptions,
    ) -> PoolResult<()> {
        let candidates = self
            .endpoints
            .good_endpoints()
            .len()
            .max(usize::from(options.endpoint.is_some()));
        let mut remaining = match options.submit_count {
            0 => DEFAULT_SUBMIT_COUNT,
            n => n,
        };
        let mut accepted = false;
        let mut attempts = 0;
        let mut first_error = None;

        for i in 0..candidates {
            let endpoint = match (&options.endpoint, i) {
                (Some(preferred), 0) => Some(preferred.clone()),
                _ => self.endpoints.select(
                    SelectionMode::ByIndex(i + options.start_offset),
                    &options.group,
                    &[],
                ),
            };
            let Some(endpoint) = endpoint else {
                continue;
            };

            attempts += 1;
            let result = send_to(&endpoint, tx, raw).await;
            options.log(tx, &endpoint, i, 0, result.as_ref().err());
            match result {
                Err(e) if !e.is_already_known() => {
                    first_error.get_or_insert(e);
                }
                _ => {
                    accepted = true;
                    remaining -= 1;
                    if remaining == 0 {
                        break;
                    }
                }
            }
        }

        if accepted {
            return Ok(());
        }
        Err(match first_error {
            Some(PoolError::Rpc(last)) => PoolError::SubmissionFailed {
                endpoints: attempts,
                last,
            },
            Some(other) => other,
            None => PoolError::NoEndpoint,
        })
    }

    async fn run_rebroadcaster(
        self: Arc<Self>,
        tx: Arc<SignedTransaction>,
        raw: Option<Bytes>,
        options: SubmissionOptions,
        interval: Duration,
        confirm: CancellationToken,
    ) {
        for round in 1..=options.max_rebroadcasts {
            tokio::select! {
                _ = confirm.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if self
                .rebroadcast_once(&tx, raw.as_deref(), &options, round, &confirm)
                .await
            {
                debug!(tx = %tx.hash(), round, "node already knows tx, rebroadcast stopped");
                return;
            }
        }
    }

    /// One rebroadcast round over up to five endpoints past the initial one.
    ///
    /// Stops at the first endpoint that accepts; returns true when a node
    /// reported the transaction as already known.
    pub(super) async fn rebroadcast_once(
        &self,
        tx: &SignedTransaction,
        raw: Option<&[u8]>,
        options: &SubmissionOptions,
        round: u32,
        cancel: &CancellationToken,
    ) -> bool {
        let count = self.endpoints.good_endpoints().len().min(MAX_REBROADCAST_ENDPOINTS);
        for j in 0..count {
            if cancel.is_cancelled() {
                break;
            }
            let Some(endpoint) = self.endpoints.select(
                SelectionMode::ByIndex(j + options.start_offset + 1),
                &options.group,
                &[],
            ) else {
                break;
            };
            if let Some(on_rebroadcast) = &options.on_rebroadcast {
                on_rebroadcast(tx, options, &endpoint);
            }
            let result = send_to(&endpoint, tx, raw).await;
            options.log(tx, &endpoint, j, round, result.as_ref().err());
            match result {
                Ok(()) => return false,
                Err(e) if e.is_already_known() => return true,
                Err(_) => {}
            }
        }
        false
    }
}

//! Bulk submission across many accounts

use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use txflood_types::{Receipt, SignedTransaction};

use super::{SubmissionOptions, TxOutcome, TxPool};
use crate::account::Account;
use crate::{PoolError, PoolResult};

/// Progress callback
pub type ProgressFn = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Counters reported while a batch runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchProgress {
    /// Transactions in the batch
    pub total: usize,
    /// Accepted by at least one endpoint
    pub submitted: usize,
    /// Finished tracking, confirmed or not
    pub completed: usize,
    /// Finished with an error
    pub failed: usize,
    /// Resubmissions spent from the retry budget
    pub retries: usize,
}

/// Batch submission settings
#[derive(Clone)]
pub struct BatchOptions {
    /// Options applied to every transaction
    pub submission: SubmissionOptions,
    /// Unfinished transactions allowed per account, 0 for no limit
    pub pending_limit: usize,
    /// Resubmissions allowed across the batch after a rejected submission
    pub retry_budget: usize,
    /// Pause before a resubmission
    pub retry_delay: Duration,
    /// Progress reporting cadence
    pub progress_interval: Option<Duration>,
    /// Progress callback
    pub on_progress: Option<ProgressFn>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            submission: SubmissionOptions::new().rebroadcast(true),
            pending_limit: 0,
            retry_budget: 0,
            retry_delay: Duration::from_secs(1),
            progress_interval: None,
            on_progress: None,
        }
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("submission", &self.submission)
            .field("pending_limit", &self.pending_limit)
            .field("retry_budget", &self.retry_budget)
            .field("retry_delay", &self.retry_delay)
            .field("progress_interval", &self.progress_interval)
            .finish_non_exhaustive()
    }
}

/// Receipts of one account's transactions in input order, plus the first error
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// `None` where a transaction was not confirmed
    pub receipts: Vec<Option<Receipt>>,
    /// First error seen
    pub error: Option<PoolError>,
}

struct BatchState {
    progress: Mutex<BatchProgress>,
    retries_left: AtomicUsize,
    first_error: Mutex<Option<PoolError>>,
    cancel: CancellationToken,
}

impl BatchState {
    fn update(&self, f: impl FnOnce(&mut BatchProgress)) {
        f(&mut self.progress.lock());
    }

    fn snapshot(&self) -> BatchProgress {
        *self.progress.lock()
    }

    fn take_retry(&self) -> bool {
        self.retries_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn record_error(&self, error: PoolError) {
        self.first_error.lock().get_or_insert(error);
    }

    /// Record an unrecoverable failure and stop all outstanding work
    fn abort(&self, error: PoolError) {
        self.record_error(error);
        self.cancel.cancel();
    }
}

impl TxPool {
    /// Submit many accounts' transaction lists concurrently.
    ///
    /// Each account keeps at most `pending_limit` transactions in flight.
    /// A submission rejected by every endpoint is retried while the batch
    /// retry budget lasts; once it is exhausted all outstanding work is
    /// cancelled and that error is returned.
    pub async fn send_batch(
        self: &Arc<Self>,
        batch: Vec<(Arc<Account>, Vec<SignedTransaction>)>,
        options: BatchOptions,
        cancel: &CancellationToken,
    ) -> PoolResult<Vec<Vec<Option<Receipt>>>> {
        let (receipts, error) = self.run_batch(batch, &options, cancel).await;
        match error {
            Some(e) => Err(e),
            None => Ok(receipts),
        }
    }

    /// Submit one account's transactions and wait for all of them
    pub async fn send_transaction_batch(
        self: &Arc<Self>,
        account: &Arc<Account>,
        txs: Vec<SignedTransaction>,
        options: BatchOptions,
        cancel: &CancellationToken,
    ) -> BatchResult {
        if txs.is_empty() {
            return BatchResult::default();
        }
        let (mut receipts, error) = self
            .run_batch(vec![(account.clone(), txs)], &options, cancel)
            .await;
        BatchResult {
            receipts: receipts.pop().unwrap_or_default(),
            error,
        }
    }

    async fn run_batch(
        self: &Arc<Self>,
        batch: Vec<(Arc<Account>, Vec<SignedTransaction>)>,
        options: &BatchOptions,
        cancel: &CancellationToken,
    ) -> (Vec<Vec<Option<Receipt>>>, Option<PoolError>) {
        let total = batch.iter().map(|(_, txs)| txs.len()).sum();
        let state = Arc::new(BatchState {
            progress: Mutex::new(BatchProgress {
                total,
                ..Default::default()
            }),
            retries_left: AtomicUsize::new(options.retry_budget),
            first_error: Mutex::new(None),
            cancel: cancel.child_token(),
        });

        let done = CancellationToken::new();
        if let (Some(every), Some(on_progress)) = (options.progress_interval, options.on_progress.clone()) {
            let state = state.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = done.cancelled() => break,
                        _ = ticker.tick() => on_progress(state.snapshot()),
                    }
                }
            });
        }

        let runs = batch
            .into_iter()
            .map(|(account, txs)| self.run_account_batch(account, txs, options, state.clone()));
        let receipts = join_all(runs).await;
        done.cancel();

        if let Some(on_progress) = &options.on_progress {
            on_progress(state.snapshot());
        }
        let error = state.first_error.lock().take();
        if cancel.is_cancelled() {
            return (receipts, error.or(Some(PoolError::Cancelled)));
        }
        (receipts, error)
    }

    async fn run_account_batch(
        self: &Arc<Self>,
        account: Arc<Account>,
        txs: Vec<SignedTransaction>,
        options: &BatchOptions,
        state: Arc<BatchState>,
    ) -> Vec<Option<Receipt>> {
        let total = txs.len();
        let window = Arc::new(Semaphore::new(match options.pending_limit {
            0 => Semaphore::MAX_PERMITS,
            n => n,
        }));

        let mut waiters = Vec::with_capacity(total);
        for tx in txs {
            let permit = tokio::select! {
                _ = state.cancel.cancelled() => break,
                permit = window.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let outcome = match self.submit_with_retry(&account, Arc::new(tx), options, &state).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    state.abort(e);
                    break;
                }
            };
            state.update(|p| p.submitted += 1);

            let state = state.clone();
            waiters.push(tokio::spawn(async move {
                let outcome = outcome.await.unwrap_or(TxOutcome {
                    receipt: None,
                    error: Some(PoolError::Cancelled),
                });
                drop(permit);
                state.update(|p| {
                    p.completed += 1;
                    if outcome.error.is_some() {
                        p.failed += 1;
                    }
                });
                if let Some(e) = outcome.error {
                    state.record_error(e);
                }
                outcome.receipt
            }));
        }

        let mut receipts: Vec<Option<Receipt>> = join_all(waiters)
            .await
            .into_iter()
            .map(|joined| joined.ok().flatten())
            .collect();
        receipts.resize(total, None);
        receipts
    }

    async fn submit_with_retry(
        self: &Arc<Self>,
        account: &Arc<Account>,
        tx: Arc<SignedTransaction>,
        options: &BatchOptions,
        state: &BatchState,
    ) -> PoolResult<oneshot::Receiver<TxOutcome>> {
        loop {
            let result = self
                .submit(account, tx.clone(), options.submission.clone(), state.cancel.clone(), true)
                .await;
            let error = match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };
            if !state.take_retry() {
                warn!(account = %account.address(), nonce = tx.nonce(), error = %error, "submission failed, retry budget exhausted");
                return Err(match options.retry_budget {
                    0 => error,
                    budget => PoolError::RetryBudgetExhausted(budget),
                });
            }
            state.update(|p| p.retries += 1);
            debug!(account = %account.address(), nonce = tx.nonce(), error = %error, "retrying submission");
            tokio::select! {
                _ = state.cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = tokio::time::sleep(options.retry_delay) => {}
            }
        }
    }
}

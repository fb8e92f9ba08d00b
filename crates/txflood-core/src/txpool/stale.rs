//! Stale confirmation sweep and nonce gap filling

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SubmissionOptions, TxPool};
use crate::account::{Account, PendingTx};
use crate::supervisor::guarded;
use crate::PoolResult;

const GWEI: u128 = 1_000_000_000;

impl TxPool {
    /// Sweep all accounts whenever the block loop reports a new height
    pub(super) async fn run_stale_loop(
        self: Arc<Self>,
        mut heights: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = heights.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let height = *heights.borrow_and_update();
            self.sweep_stale(height).await;
        }
        debug!("stale sweep stopped");
    }

    /// Check every tracked account against the on-chain nonce at `height`
    pub async fn sweep_stale(self: &Arc<Self>, height: u64) {
        for account in self.accounts() {
            let pool = self.clone();
            guarded("stale sweep", async move { pool.sweep_account(&account, height).await }).await;
        }
    }

    async fn sweep_account(self: &Arc<Self>, account: &Arc<Account>, height: u64) -> PoolResult<()> {
        if !account.needs_stale_sweep(height, self.config.stale_threshold_blocks) {
            return Ok(());
        }
        let config = &self.config;
        let due = |pending: &PendingTx| {
            pending.last_rebroadcast.elapsed()
                >= config.stale_rebroadcast_backoff(pending.rebroadcast_count)
        };
        let sweep = account
            .sweep_stale(&self.endpoints, height, config.stale_nonce_retries, due)
            .await?;

        for pending in sweep.rebroadcast {
            let pool = self.clone();
            let cancel = self.shutdown.child_token();
            tokio::spawn(async move {
                let options = SubmissionOptions::new().group(pending.group.clone());
                debug!(tx = %pending.tx.hash(), round = pending.rebroadcast_count, "rebroadcasting stale tx");
                pool.rebroadcast_once(
                    &pending.tx,
                    pending.raw.as_deref(),
                    &options,
                    pending.rebroadcast_count,
                    &cancel,
                )
                .await;
            });
        }

        if !sweep.gaps.is_empty() {
            let group = account
                .pending_txs()
                .first()
                .map(|p| p.group.clone())
                .unwrap_or_default();
            tokio::spawn(self.clone().fill_nonce_gaps(account.clone(), sweep.gaps, group));
        }
        Ok(())
    }

    /// Send zero-value self-transfers at each gap nonce
    async fn fill_nonce_gaps(self: Arc<Self>, account: Arc<Account>, gaps: Vec<u64>, group: String) {
        let base_fee = self.current_base_fee().unwrap_or(GWEI);
        let fee_cap = base_fee.saturating_mul(2);
        let tip = GWEI.min(fee_cap);
        let cancel = self.shutdown.child_token();

        for nonce in gaps {
            if cancel.is_cancelled() {
                return;
            }
            let filler = match account.build_filler_tx(nonce, tip, fee_cap) {
                Ok(tx) => tx,
                Err(e) => {
                    warn!(account = %account.address(), nonce, error = %e, "failed to build filler transaction");
                    continue;
                }
            };
            let address = account.address();
            let options = SubmissionOptions::new()
                .group(group.clone())
                .rebroadcast(true)
                .on_complete(move |tx, receipt, error| match (receipt, error) {
                    (_, Some(e)) => {
                        warn!(account = %address, nonce = tx.nonce(), error = %e, "filler transaction failed")
                    }
                    (Some(_), None) => {
                        info!(account = %address, nonce = tx.nonce(), tx = %tx.hash(), "filler transaction confirmed")
                    }
                    (None, None) => {}
                });
            if let Err(e) = self
                .submit(&account, Arc::new(filler), options, cancel.clone(), true)
                .await
            {
                warn!(account = %account.address(), nonce, error = %e, "failed to submit filler transaction");
            }
        }
    }
}

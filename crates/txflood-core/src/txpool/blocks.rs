//! Block ingestion: head polling, fetch, and per-block confirmation

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use txflood_primitives::Address;
use txflood_types::{Block, Receipt};

use super::{BlockInfo, BlockStats, ChainHead, TrackedTx, TxPool};
use crate::endpoint::Endpoint;
use crate::supervisor::guarded;
use crate::{PoolError, PoolResult};

/// A block body with its receipts and decoded senders, fully validated
pub(super) struct FetchedBlock {
    pub block: Block,
    pub receipts: Vec<Receipt>,
    pub senders: Vec<Address>,
}

impl TxPool {
    /// Poll for new heads until cancelled
    pub(super) async fn run_block_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let pool = self.clone();
            guarded("block loop", async move { pool.poll_once().await }).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }
        debug!("block loop stopped");
    }

    /// One polling step: find the highest head and process every block up to it.
    ///
    /// Stops at the first block no source can process; it is retried on the
    /// next call. Returns the highest processed block.
    pub async fn poll_once(self: &Arc<Self>) -> PoolResult<u64> {
        let mut last = self.last_processed_block();
        let Some((head, sources)) = self.highest_head().await else {
            return Ok(last);
        };
        if head <= last {
            return Ok(last);
        }
        if last == 0 && head > self.config.history_skip_threshold {
            last = head - 1;
            self.last_processed.store(last, Ordering::Release);
        }

        let start = last;
        for number in start + 1..=head {
            let mut processed = false;
            for endpoint in &sources {
                match self.process_block(endpoint, number).await {
                    Ok(()) => {
                        processed = true;
                        break;
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint.name(), block = number, error = %e, "error processing block")
                    }
                }
            }
            if !processed {
                error!(block = number, "failed to process block");
                break;
            }
            last = number;
            self.last_processed.store(number, Ordering::Release);
        }

        if last > start {
            self.stale_notify.send_replace(last);
        }
        Ok(last)
    }

    /// Query every good non-builder endpoint for its head, uncached
    async fn highest_head(&self) -> Option<(u64, Vec<Arc<Endpoint>>)> {
        let timeout = self.config.head_timeout();
        let good = self.endpoints.good_endpoints();
        let queries = good.iter().filter(|e| !e.is_builder()).map(|endpoint| async move {
            match tokio::time::timeout(timeout, endpoint.fetch_head()).await {
                Ok(Ok(height)) => Some((endpoint.clone(), height)),
                Ok(Err(e)) => {
                    debug!(endpoint = %endpoint.name(), error = %e, "head query failed");
                    None
                }
                Err(_) => None,
            }
        });
        let heads: Vec<_> = join_all(queries).await.into_iter().flatten().collect();
        let max = heads.iter().map(|(_, h)| *h).max()?;
        let sources = heads
            .into_iter()
            .filter(|(_, h)| *h == max)
            .map(|(e, _)| e)
            .collect();
        Some((max, sources))
    }

    /// Fetch the body and receipts of `number`.
    ///
    /// Rejects count mismatches and undecodable senders, so a returned block
    /// can always be applied.
    pub(super) async fn fetch_block(
        &self,
        endpoint: &Endpoint,
        number: u64,
    ) -> PoolResult<FetchedBlock> {
        let timeout = self.config.fetch_timeout();
        let block = tokio::time::timeout(timeout, endpoint.block(number))
            .await
            .map_err(|_| PoolError::Timeout(format!("block {}", number)))??;
        let receipts = tokio::time::timeout(timeout, endpoint.block_receipts(number))
            .await
            .map_err(|_| PoolError::Timeout(format!("receipts of block {}", number)))??;
        if receipts.len() != block.tx_count() {
            return Err(PoolError::ReceiptMismatch {
                number,
                txs: block.tx_count(),
                receipts: receipts.len(),
            });
        }
        let senders = block
            .transactions
            .iter()
            .map(|tx| tx.sender())
            .collect::<Result<Vec<Address>, _>>()?;
        Ok(FetchedBlock {
            block,
            receipts,
            senders,
        })
    }

    async fn process_block(self: &Arc<Self>, endpoint: &Arc<Endpoint>, number: u64) -> PoolResult<()> {
        if self.accounts.is_empty() {
            return Ok(());
        }

        let fetched = self.fetch_block(endpoint, number).await?;

        let mismatch = number
            .checked_sub(1)
            .and_then(|parent| self.cache.lock().blocks.get(&parent).copied())
            .filter(|parent| parent.hash != fetched.block.parent_hash);
        if let Some(cached) = mismatch {
            warn!(
                block = number,
                expected = %cached.hash,
                got = %fetched.block.parent_hash,
                "chain reorganization detected"
            );
            self.recover_reorg(endpoint, &fetched).await?;
        }

        let stats = self.apply_block(&fetched);
        info!(
            block = number,
            txs = stats.tx_count,
            confirmed = stats.confirmed,
            accounts = stats.affected_accounts,
            "processed block"
        );
        let _ = self.block_events.send(stats);
        Ok(())
    }

    /// Record a fetched block and settle the registered accounts it touches
    pub(super) fn apply_block(&self, fetched: &FetchedBlock) -> BlockStats {
        let block = &fetched.block;

        {
            let mut cache = self.cache.lock();
            cache.blocks.insert(
                block.number,
                BlockInfo {
                    number: block.number,
                    hash: block.hash,
                    parent_hash: block.parent_hash,
                    timestamp: block.timestamp,
                    gas_limit: block.gas_limit,
                },
            );
            let keep_from = block.number.saturating_sub(self.config.reorg_depth) + 1;
            cache.blocks = cache.blocks.split_off(&keep_from);
            cache.tracked = cache.tracked.split_off(&keep_from);
        }
        *self.head.write() = ChainHead {
            gas_limit: block.gas_limit,
            base_fee: block.base_fee_per_gas,
        };

        let mut tracked = Vec::new();
        let mut affected = HashSet::new();
        let mut confirmed = 0;

        for ((tx, receipt), from) in block.transactions.iter().zip(&fetched.receipts).zip(&fetched.senders) {
            if receipt.transaction_hash != tx.hash {
                warn!(block = block.number, tx = %tx.hash, "receipt does not match transaction, skipped");
                continue;
            }
            let from = *from;
            let sender = self.account(&from);
            let recipient = tx.to.and_then(|to| self.account(&to));
            if sender.is_none() && recipient.is_none() {
                continue;
            }

            let fee = receipt.fee();
            let pending = sender
                .as_ref()
                .and_then(|account| account.pending_tx(tx.nonce, &tx.hash));
            tracked.push(TrackedTx {
                hash: tx.hash,
                block_number: block.number,
                from,
                to: tx.to,
                nonce: tx.nonce,
                value: tx.value,
                fee,
                tx: tx.signed.clone().map(Arc::new),
                pending,
                sender_tracked: sender.is_some(),
                recipient_tracked: recipient.is_some(),
            });

            if let Some(account) = &sender {
                confirmed += 1;
                affected.insert(from);
                account.sub_balance(tx.value.saturating_add(fee));
                account.resolve(block.number, tx.nonce, receipt.clone());
            }
            if let Some(account) = &recipient {
                account.add_balance(tx.value);
            }
        }

        let stats = BlockStats {
            number: block.number,
            tx_count: block.tx_count(),
            tracked_txs: tracked.len(),
            confirmed,
            affected_accounts: affected.len(),
            base_fee: block.base_fee_per_gas,
            gas_limit: block.gas_limit,
        };
        self.cache.lock().tracked.insert(block.number, tracked);
        stats
    }
}

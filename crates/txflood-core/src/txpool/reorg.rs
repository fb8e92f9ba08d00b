//! Reorg recovery

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use txflood_primitives::Address;

use super::blocks::FetchedBlock;
use super::{SubmissionOptions, TrackedTx, TxPool};
use crate::endpoint::Endpoint;
use crate::PoolResult;

impl TxPool {
    /// Repair state after `new_block` turned out not to extend the cached chain.
    ///
    /// Every parent is fetched and validated before any state changes, so a
    /// failed fetch leaves the pool untouched and the block is retried
    /// wholesale.
    pub(super) async fn recover_reorg(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        new_block: &FetchedBlock,
    ) -> PoolResult<()> {
        let mut parents = Vec::new();
        let mut number = new_block.block.number;
        let mut parent_hash = new_block.block.parent_hash;
        while number > 0 {
            let parent_number = number - 1;
            let joined = match self.cache.lock().blocks.get(&parent_number) {
                Some(cached) => cached.hash == parent_hash,
                None => true,
            };
            if joined {
                break;
            }
            let parent = self.fetch_block(endpoint, parent_number).await?;
            number = parent.block.number;
            parent_hash = parent.block.parent_hash;
            parents.push(parent);
        }
        let first_replaced = number;

        let abandoned: Vec<TrackedTx> = {
            let mut cache = self.cache.lock();
            let _ = cache.blocks.split_off(&first_replaced);
            cache
                .tracked
                .split_off(&first_replaced)
                .into_values()
                .flatten()
                .collect()
        };

        let mut rewound = HashSet::new();
        for tracked in &abandoned {
            if tracked.sender_tracked {
                self.reopen_abandoned(tracked, &mut rewound).await;
            }
            if tracked.recipient_tracked {
                if let Some(to) = tracked.to.and_then(|to| self.account(&to)) {
                    to.sub_balance(tracked.value);
                }
            }
        }

        for parent in parents.iter().rev() {
            self.apply_block(parent);
        }

        info!(
            block = new_block.block.number,
            first_replaced,
            abandoned = abandoned.len(),
            accounts = rewound.len(),
            replayed = parents.len(),
            "reorg recovered"
        );
        Ok(())
    }

    /// Undo the inclusion of a tracked sender's transaction and put it back
    /// into the pending state
    async fn reopen_abandoned(
        self: &Arc<Self>,
        tracked: &TrackedTx,
        rewound: &mut HashSet<Address>,
    ) {
        let Some(account) = self.account(&tracked.from) else {
            return;
        };
        if rewound.insert(tracked.from) {
            account.reopen_from(tracked.nonce);
        }
        account.add_balance(tracked.value.saturating_add(tracked.fee));

        let Some(tx) = tracked.tx.clone() else {
            warn!(account = %tracked.from, tx = %tracked.hash, "reorged out tx has an unsupported envelope, not resubmitted");
            return;
        };

        let mut options = SubmissionOptions::new()
            .rebroadcast(true)
            .rebroadcast_every(
                self.config.reorg_rebroadcast_interval(),
                self.config.reorg_max_rebroadcasts,
            )
            .on_complete(|tx, receipt, _| {
                if receipt.is_some() {
                    info!(tx = %tx.hash(), "reorged out tx confirmed");
                }
            });
        if let Some(pending) = &tracked.pending {
            options.group = pending.group.clone();
            if let Some(raw) = pending.raw.clone() {
                options = options.on_encode(move |_| Ok(Some(raw.clone())));
            }
        }

        let cancel = self.shutdown.child_token();
        if let Err(e) = self.submit(&account, tx, options, cancel, false).await {
            error!(account = %tracked.from, tx = %tracked.hash, error = %e, "could not re-track reorged out tx");
        }
    }
}

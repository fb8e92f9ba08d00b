//! The flood run: connect, prepare, send, report

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use txflood_core::{
    Account, BatchOptions, BatchProgress, EndpointPool, PoolError, SubmissionOptions, TxBuilder,
    TxPool,
};

use crate::config::Config;

/// Fee cap headroom over the node's suggested gas price
const FEE_CAP_MULTIPLIER: u128 = 2;

/// Run one flood until every transaction finished or `cancel` fires
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let key = config
        .flood
        .privkey
        .clone()
        .ok_or_else(|| anyhow!("no sender key, pass --privkey or set flood.privkey"))?;

    let endpoints = Arc::new(
        EndpointPool::from_config(config.endpoints.clone()).context("configuring endpoints")?,
    );
    let chain_id = endpoints.prepare().await.context("preparing endpoint pool")?;
    let health = tokio::spawn(endpoints.clone().run_health_loop(cancel.child_token()));

    let pool = TxPool::new(endpoints.clone(), config.txpool.clone());
    let mut tasks = pool.start(&cancel);
    tasks.push(health);
    tasks.push(tokio::spawn(log_blocks(pool.clone(), cancel.child_token())));

    let result = flood(&pool, &config, &key, chain_id, &cancel).await;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    result
}

async fn flood(
    pool: &Arc<TxPool>,
    config: &Config,
    key: &str,
    chain_id: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let account = Account::from_private_key_hex(key).context("loading sender key")?;
    account.set_chain_id(chain_id);
    let account = pool.register_account(Arc::new(account));

    let endpoint = pool
        .endpoints()
        .any()
        .ok_or_else(|| anyhow!("no healthy endpoint"))?;
    account
        .update_from_chain(&endpoint)
        .await
        .context("loading sender state")?;
    let (gas_price, tip) = endpoint.suggested_fees().await?;
    let fee_cap = gas_price.saturating_mul(FEE_CAP_MULTIPLIER);
    let tip = tip.min(fee_cap);
    info!(
        account = %account.address(),
        nonce = account.pending_nonce(),
        balance = %account.balance(),
        fee_cap,
        tip,
        "sender ready"
    );

    let flood = &config.flood;
    let builder = TxBuilder::transfer(account.address(), u128::from(flood.value))
        .max_fee_per_gas(fee_cap)
        .max_priority_fee_per_gas(tip);
    let txs = (0..flood.count)
        .map(|_| account.build_transaction(&builder))
        .collect::<Result<Vec<_>, _>>()?;

    let options = BatchOptions {
        submission: SubmissionOptions::new().rebroadcast(true).rebroadcast_every(
            Duration::from_secs(flood.rebroadcast_interval_secs),
            flood.max_rebroadcasts,
        ),
        pending_limit: flood.pending_limit,
        retry_budget: flood.retry_budget,
        progress_interval: Some(Duration::from_secs(flood.progress_interval_secs)),
        on_progress: Some(Arc::new(log_progress)),
        ..Default::default()
    };

    info!(count = flood.count, pending_limit = flood.pending_limit, "flood started");
    let result = pool
        .send_transaction_batch(&account, txs, options, cancel)
        .await;

    let confirmed = result.receipts.iter().flatten().count();
    let reverted = result
        .receipts
        .iter()
        .flatten()
        .filter(|r| !r.is_success())
        .count();
    info!(
        confirmed,
        reverted,
        total = result.receipts.len(),
        submitted = account.submitted_count(),
        "flood finished"
    );

    match result.error {
        Some(PoolError::Cancelled) => {
            warn!("flood cancelled");
            Ok(())
        }
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn log_progress(progress: BatchProgress) {
    info!(
        total = progress.total,
        submitted = progress.submitted,
        completed = progress.completed,
        failed = progress.failed,
        retries = progress.retries,
        "progress"
    );
}

async fn log_blocks(pool: Arc<TxPool>, cancel: CancellationToken) {
    let mut events = pool.subscribe();
    loop {
        let stats = tokio::select! {
            _ = cancel.cancelled() => break,
            stats = events.recv() => stats,
        };
        match stats {
            Ok(stats) => info!(
                block = stats.number,
                txs = stats.tx_count,
                confirmed = stats.confirmed,
                base_fee = stats.base_fee.unwrap_or_default(),
                gas_limit = stats.gas_limit,
                "block"
            ),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "block stats lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

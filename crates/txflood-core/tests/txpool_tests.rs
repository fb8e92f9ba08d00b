//! Transaction pool integration tests
//!
//! Runs the pool against a scripted in-memory chain: confirmation, endpoint
//! fallback, rebroadcasting, stale sweeps, reorg recovery and batches.

mod common;

use common::{account, endpoint_pool, single_endpoint_pool, test_pool_config, MockChain, CHAIN_ID};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use txflood_core::{
    Account, BatchOptions, PoolError, SubmissionOptions, TxBuilder, TxPool, TxPoolConfig,
};
use txflood_primitives::Address;
use txflood_rpc::RpcError;
use txflood_types::SignedTransaction;

const GWEI: u128 = 1_000_000_000;

fn recipient() -> Address {
    Address::from_bytes([0x42; 20])
}

fn transfer(account: &Account, value: u128) -> SignedTransaction {
    account
        .build_transaction(
            &TxBuilder::transfer(recipient(), value)
                .max_fee_per_gas(2 * GWEI)
                .max_priority_fee_per_gas(GWEI),
        )
        .unwrap()
}

/// Same-nonce transfer built outside the account's nonce counter
fn transfer_at(account: &Account, nonce: u64, value: u128) -> SignedTransaction {
    let body = TxBuilder::transfer(recipient(), value)
        .max_fee_per_gas(2 * GWEI)
        .max_priority_fee_per_gas(GWEI)
        .build(nonce, CHAIN_ID)
        .unwrap();
    account.sign(body).unwrap()
}

async fn wait_for_sent(chain: &MockChain, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while chain.sent().len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transactions were not submitted in time");
}

/// Pool with one registered account, the chain head already processed
async fn ready_pool(chain: &Arc<MockChain>) -> (Arc<TxPool>, Arc<Account>) {
    let (_, pool) = single_endpoint_pool(chain);
    let account = pool.register_account(account(0x11));
    assert_eq!(pool.poll_once().await.unwrap(), chain.head());
    (pool, account)
}

// ==================== Block Ingestion Tests ====================

#[tokio::test]
async fn test_startup_skips_history() {
    let chain = MockChain::new(100);
    let (pool, _) = ready_pool(&chain).await;
    assert_eq!(pool.last_processed_block(), 100);
    assert!(pool.block_info(100).is_some());
    assert!(pool.block_info(99).is_none());
}

#[tokio::test]
async fn test_block_confirms_tracked_sender() {
    let chain = MockChain::new(100);
    let (pool, account) = ready_pool(&chain).await;
    let mut events = pool.subscribe();

    let tx = transfer(&account, 1_000);
    pool.send(&account, tx.clone(), SubmissionOptions::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(chain.sent(), vec![tx.hash()]);

    chain.mine(vec![tx.clone()]);
    assert_eq!(pool.poll_once().await.unwrap(), 101);

    let stats = events.recv().await.unwrap();
    assert_eq!(stats.number, 101);
    assert_eq!(stats.tx_count, 1);
    assert_eq!(stats.confirmed, 1);
    assert_eq!(stats.affected_accounts, 1);
    assert_eq!(account.confirmed_nonce(), 1);
    assert!(pool.is_tracked(&tx.hash()));
    assert!(account.pending_txs().is_empty());
    assert_eq!(pool.current_gas_limit(), 30_000_000);
}

#[tokio::test]
async fn test_untracked_block_is_still_cached() {
    let chain = MockChain::new(100);
    let (pool, _) = ready_pool(&chain).await;
    let stranger = account(0x77);

    chain.mine(vec![transfer(&stranger, 5)]);
    pool.poll_once().await.unwrap();

    assert!(pool.block_info(101).is_some());
    assert!(pool.tracked_txs(101).is_empty());
}

// ==================== Submission Tests ====================

#[tokio::test]
async fn test_send_and_await_returns_receipt() {
    let chain = MockChain::new(100);
    let (pool, account) = ready_pool(&chain).await;
    let tx = transfer(&account, 7);
    let hash = tx.hash();

    let confirmed = Arc::new(AtomicUsize::new(0));
    let seen = confirmed.clone();
    let options = SubmissionOptions::new().on_confirm(move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let waiter = {
        let pool = pool.clone();
        let account = account.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            pool.send_and_await(&account, tx, options, &CancellationToken::new())
                .await
        })
    };
    wait_for_sent(&chain, 1).await;
    chain.mine(vec![tx]);
    pool.poll_once().await.unwrap();

    let receipt = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(receipt.transaction_hash, hash);
    assert_eq!(receipt.block_number, 101);
    assert_eq!(confirmed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_replaced_nonce_resolves_without_receipt() {
    let chain = MockChain::new(100);
    let (pool, account) = ready_pool(&chain).await;
    let original = transfer_at(&account, 0, 1);
    let replacement = transfer_at(&account, 0, 2);
    assert_ne!(original.hash(), replacement.hash());

    let waiter = {
        let pool = pool.clone();
        let account = account.clone();
        let tx = original.clone();
        tokio::spawn(async move {
            pool.send_and_await(&account, tx, SubmissionOptions::new(), &CancellationToken::new())
                .await
        })
    };
    wait_for_sent(&chain, 1).await;
    chain.mine(vec![replacement]);
    pool.poll_once().await.unwrap();

    assert!(waiter.await.unwrap().unwrap().is_none());
}

#[tokio::test]
async fn test_submission_falls_back_to_next_endpoint() {
    let chain = MockChain::new(100);
    let (broken_transport, broken) = chain.endpoint("http://broken");
    broken_transport.fail_sends(RpcError::Rpc {
        code: -32000,
        message: "insufficient funds for gas * price + value".into(),
    });

    let pool = TxPool::new(endpoint_pool(vec![broken.clone()]), test_pool_config());
    let sender = pool.register_account(account(0x11));
    let tx = transfer(&sender, 1);
    let result = pool
        .send(&sender, tx.clone(), SubmissionOptions::new(), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(PoolError::SubmissionFailed { endpoints: 1, .. })));
    assert!(sender.pending_txs().is_empty());

    let (healthy_transport, healthy) = chain.endpoint("http://healthy");
    let pool = TxPool::new(endpoint_pool(vec![broken, healthy]), test_pool_config());
    let sender = pool.register_account(account(0x11));
    pool.send(&sender, tx.clone(), SubmissionOptions::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(broken_transport.send_count(), 2);
    assert_eq!(healthy_transport.send_count(), 1);
    assert_eq!(chain.sent(), vec![tx.hash()]);
}

#[tokio::test]
async fn test_already_known_counts_as_accepted() {
    let chain = MockChain::new(100);
    let (transport, pool) = single_endpoint_pool(&chain);
    transport.fail_sends(RpcError::Rpc {
        code: -32000,
        message: "already known".into(),
    });
    let sender = pool.register_account(account(0x11));

    let tx = transfer(&sender, 1);
    pool.send(&sender, tx, SubmissionOptions::new(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(sender.submitted_count(), 1);
}

#[tokio::test]
async fn test_cancelled_wait_completes_once() {
    let chain = MockChain::new(100);
    let (pool, account) = ready_pool(&chain).await;

    let completions = Arc::new(AtomicUsize::new(0));
    let counter = completions.clone();
    let options = SubmissionOptions::new().on_complete(move |_, receipt, error| {
        assert!(receipt.is_none());
        assert!(matches!(error, Some(PoolError::Cancelled)));
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });

    let result = pool
        .send_and_await(&account, transfer(&account, 1), options, &cancel)
        .await;
    assert!(matches!(result, Err(PoolError::Cancelled)));
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_send_after_cancel_is_rejected() {
    let chain = MockChain::new(100);
    let (pool, account) = ready_pool(&chain).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = pool
        .send(&account, transfer(&account, 1), SubmissionOptions::new(), &cancel)
        .await;
    assert!(matches!(result, Err(PoolError::Cancelled)));
    assert!(chain.sent().is_empty());
}

#[tokio::test]
async fn test_send_and_await_range_returns_receipts_in_order() {
    let chain = MockChain::new(100);
    let (pool, account) = ready_pool(&chain).await;
    let txs: Vec<_> = (0..3).map(|i| transfer(&account, i)).collect();
    let expected: Vec<_> = txs.iter().map(|tx| (tx.hash(), 101)).collect();

    let waiter = {
        let pool = pool.clone();
        let account = account.clone();
        let txs = txs.clone();
        tokio::spawn(async move {
            pool.send_and_await_range(&account, txs, SubmissionOptions::new(), &CancellationToken::new())
                .await
        })
    };
    wait_for_sent(&chain, 3).await;
    chain.mine(txs);
    pool.poll_once().await.unwrap();

    let receipts = waiter.await.unwrap().unwrap();
    let got: Vec<_> = receipts
        .iter()
        .map(|r| {
            let r = r.as_ref().unwrap();
            (r.transaction_hash, r.block_number)
        })
        .collect();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn test_send_and_await_range_stops_at_rejection() {
    let chain = MockChain::new(100);
    let (transport, pool) = single_endpoint_pool(&chain);
    transport.fail_sends(RpcError::Rpc {
        code: -32000,
        message: "nonce too low".into(),
    });
    let sender = pool.register_account(account(0x11));
    let txs = vec![transfer(&sender, 1), transfer(&sender, 2)];

    let result = pool
        .send_and_await_range(&sender, txs, SubmissionOptions::new(), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(PoolError::SubmissionFailed { endpoints: 1, .. })));
    assert_eq!(transport.send_count(), 1);
    assert!(sender.pending_txs().is_empty());
}

// ==================== Rebroadcast Tests ====================

#[tokio::test]
async fn test_rebroadcaster_stops_on_confirmation() {
    let chain = MockChain::new(100);
    let (transport, pool) = single_endpoint_pool(&chain);
    let account = pool.register_account(account(0x11));
    pool.poll_once().await.unwrap();
    let tx = transfer(&account, 1);
    let options = SubmissionOptions::new().rebroadcast_every(Duration::from_millis(20), 100);

    let waiter = {
        let pool = pool.clone();
        let account = account.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            pool.send_and_await(&account, tx, options, &CancellationToken::new())
                .await
        })
    };
    // initial submission plus two rebroadcast rounds
    wait_for_sent(&chain, 3).await;
    assert!(chain.sent().iter().all(|h| *h == tx.hash()));

    chain.mine(vec![tx]);
    pool.poll_once().await.unwrap();
    assert!(waiter.await.unwrap().unwrap().is_some());

    let sends = transport.send_count();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.send_count(), sends);
}

#[tokio::test]
async fn test_rebroadcaster_stops_when_node_knows_tx() {
    let chain = MockChain::new(100);
    let (transport, pool) = single_endpoint_pool(&chain);
    transport.fail_sends(RpcError::Rpc {
        code: -32000,
        message: "already known".into(),
    });
    let sender = pool.register_account(account(0x11));
    let options = SubmissionOptions::new().rebroadcast_every(Duration::from_millis(10), 100);

    pool.send(&sender, transfer(&sender, 1), options, &CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.send_count(), 2);
}

#[tokio::test]
async fn test_rebroadcaster_respects_round_limit() {
    let chain = MockChain::new(100);
    let (transport, pool) = single_endpoint_pool(&chain);
    let sender = pool.register_account(account(0x11));
    let options = SubmissionOptions::new().rebroadcast_every(Duration::from_millis(10), 2);

    pool.send(&sender, transfer(&sender, 1), options, &CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.send_count(), 3);
}

// ==================== Stale Sweep Tests ====================

#[tokio::test]
async fn test_stale_sweep_rebroadcasts_and_fills_gap() {
    let chain = MockChain::new(100);
    let (_, endpoint) = chain.endpoint("http://node-a");
    let config = TxPoolConfig {
        stale_threshold_blocks: 1,
        stale_rebroadcast_base_secs: 0,
        ..test_pool_config()
    };
    let pool = TxPool::new(endpoint_pool(vec![endpoint]), config);
    let account = pool.register_account(account(0x11));
    pool.poll_once().await.unwrap();

    // nonce 0 was never sent, so nonce 1 cannot be included
    let stuck = transfer_at(&account, 1, 5);
    pool.send(&account, stuck.clone(), SubmissionOptions::new().rebroadcast(true), &CancellationToken::new())
        .await
        .unwrap();
    chain.mine(vec![]);
    chain.mine(vec![]);
    assert_eq!(pool.poll_once().await.unwrap(), 102);

    pool.sweep_stale(102).await;
    wait_for_sent(&chain, 3).await;

    let sent = chain.sent();
    assert_eq!(sent.iter().filter(|h| **h == stuck.hash()).count(), 2);
    let filler = account
        .pending_txs()
        .into_iter()
        .find(|p| p.tx.nonce() == 0)
        .expect("gap filler is tracked");
    assert_eq!(filler.tx.to(), Some(account.address()));
    assert_eq!(filler.tx.value(), 0);
    assert!(sent.contains(&filler.tx.hash()));

    chain.mine(vec![(*filler.tx).clone(), stuck]);
    pool.poll_once().await.unwrap();
    assert_eq!(account.confirmed_nonce(), 2);
    assert!(account.pending_txs().is_empty());
}

#[tokio::test]
async fn test_stale_sweep_waits_for_threshold() {
    let chain = MockChain::new(100);
    let (pool, account) = ready_pool(&chain).await;
    let stuck = transfer_at(&account, 1, 5);
    pool.send(&account, stuck, SubmissionOptions::new().rebroadcast(true), &CancellationToken::new())
        .await
        .unwrap();

    // default threshold is 10 blocks past the last confirmation
    pool.sweep_stale(105).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(chain.sent().len(), 1);
    assert_eq!(account.pending_txs().len(), 1);
}

// ==================== Reorg Tests ====================

#[tokio::test]
async fn test_reorg_reopens_abandoned_transaction() {
    let chain = MockChain::new(100);
    let (_, endpoint) = chain.endpoint("group(east)http://node-a");
    let pool = TxPool::new(endpoint_pool(vec![endpoint]), test_pool_config());
    let account = pool.register_account(account(0x11));
    pool.poll_once().await.unwrap();
    let tx = transfer(&account, 1_000);
    let hash = tx.hash();

    pool.send(&account, tx.clone(), SubmissionOptions::new().group("east"), &CancellationToken::new())
        .await
        .unwrap();
    let replaced = chain.mine(vec![tx]);
    pool.poll_once().await.unwrap();
    assert_eq!(account.confirmed_nonce(), 1);
    assert!(pool.is_tracked(&hash));
    let old_hash = chain.hash_of(replaced);

    chain.reorg(101, vec![vec![], vec![]]);
    assert_ne!(chain.hash_of(101), old_hash);
    assert_eq!(pool.poll_once().await.unwrap(), 102);

    assert!(!pool.is_tracked(&hash));
    assert_eq!(account.confirmed_nonce(), 0);
    let pending = account.pending_txs();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tx.hash(), hash);
    assert_eq!(pending[0].group, "east");
    assert!(pending[0].rebroadcast);
    assert_eq!(pool.block_info(101).unwrap().hash, chain.hash_of(101));
}

#[tokio::test]
async fn test_reorged_transaction_confirms_again() {
    let chain = MockChain::new(100);
    let (pool, account) = ready_pool(&chain).await;
    let tx = transfer(&account, 1_000);
    let hash = tx.hash();

    pool.send(&account, tx.clone(), SubmissionOptions::new(), &CancellationToken::new())
        .await
        .unwrap();
    chain.mine(vec![tx.clone()]);
    pool.poll_once().await.unwrap();

    chain.reorg(101, vec![vec![], vec![tx]]);
    pool.poll_once().await.unwrap();

    assert_eq!(account.confirmed_nonce(), 1);
    assert!(account.pending_txs().is_empty());
    let tracked = pool.tracked_txs(102);
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].hash, hash);
}

#[tokio::test]
async fn test_deep_reorg_replays_parents_oldest_first() {
    let chain = MockChain::new(100);
    let (pool, account) = ready_pool(&chain).await;
    let first = transfer(&account, 1);
    let second = transfer(&account, 2);
    for tx in [&first, &second] {
        pool.send(&account, tx.clone(), SubmissionOptions::new(), &CancellationToken::new())
            .await
            .unwrap();
    }
    chain.mine(vec![first.clone()]);
    chain.mine(vec![second.clone()]);
    chain.mine(vec![]);
    assert_eq!(pool.poll_once().await.unwrap(), 103);
    assert_eq!(account.confirmed_nonce(), 2);

    // three replaced blocks; both transactions land one block later
    chain.reorg(101, vec![vec![], vec![first.clone()], vec![second.clone()], vec![]]);
    assert_eq!(pool.poll_once().await.unwrap(), 104);

    for number in 101..=104 {
        assert_eq!(pool.block_info(number).unwrap().hash, chain.hash_of(number));
    }
    assert!(pool.tracked_txs(101).is_empty());
    assert_eq!(pool.tracked_txs(102)[0].hash, first.hash());
    assert_eq!(pool.tracked_txs(103)[0].hash, second.hash());
    assert_eq!(account.confirmed_nonce(), 2);
    assert!(account.pending_txs().is_empty());
}

#[tokio::test]
async fn test_failed_reorg_recovery_is_retried_whole() {
    let chain = MockChain::new(100);
    let (pool, account) = ready_pool(&chain).await;
    let tx = transfer(&account, 1_000);
    let hash = tx.hash();
    pool.send(&account, tx.clone(), SubmissionOptions::new(), &CancellationToken::new())
        .await
        .unwrap();
    chain.mine(vec![tx]);
    pool.poll_once().await.unwrap();
    let old_hash = chain.hash_of(101);

    // the replacement parent carries a transaction with no decodable sender
    chain.reorg(101, vec![]);
    let opaque = chain.mine_opaque();
    chain.mine(vec![]);
    assert_eq!(pool.poll_once().await.unwrap(), 101);

    assert!(pool.is_tracked(&hash));
    assert_eq!(account.confirmed_nonce(), 1);
    assert!(account.pending_txs().is_empty());
    assert_eq!(pool.block_info(101).unwrap().hash, old_hash);

    chain.report_sender(opaque, common::account(0x77).address());
    assert_eq!(pool.poll_once().await.unwrap(), 102);

    assert!(!pool.is_tracked(&hash));
    assert_eq!(account.confirmed_nonce(), 0);
    let pending = account.pending_txs();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tx.hash(), hash);
    assert_eq!(pool.block_info(101).unwrap().hash, chain.hash_of(101));
    assert_eq!(pool.block_info(102).unwrap().hash, chain.hash_of(102));
}

// ==================== Batch Tests ====================

#[tokio::test]
async fn test_transaction_batch_collects_receipts_in_order() {
    let chain = MockChain::new(100);
    let (pool, account) = ready_pool(&chain).await;
    let txs: Vec<_> = (0..3).map(|i| transfer(&account, i)).collect();
    let hashes: Vec<_> = txs.iter().map(|tx| tx.hash()).collect();

    let options = BatchOptions {
        pending_limit: 2,
        ..Default::default()
    };
    let batch = {
        let pool = pool.clone();
        let account = account.clone();
        let txs = txs.clone();
        tokio::spawn(async move {
            pool.send_transaction_batch(&account, txs, options, &CancellationToken::new())
                .await
        })
    };

    wait_for_sent(&chain, 2).await;
    chain.mine(txs[..2].to_vec());
    pool.poll_once().await.unwrap();
    wait_for_sent(&chain, 3).await;
    chain.mine(txs[2..].to_vec());
    pool.poll_once().await.unwrap();

    let result = batch.await.unwrap();
    assert!(result.error.is_none());
    let got: Vec<_> = result
        .receipts
        .iter()
        .map(|r| r.as_ref().unwrap().transaction_hash)
        .collect();
    assert_eq!(got, hashes);
}

#[tokio::test]
async fn test_batch_without_retry_budget_fails_fast() {
    let chain = MockChain::new(100);
    let (transport, pool) = single_endpoint_pool(&chain);
    transport.fail_sends(RpcError::Rpc {
        code: -32000,
        message: "nonce too low".into(),
    });
    let sender = pool.register_account(account(0x11));
    let txs = vec![transfer(&sender, 1), transfer(&sender, 2)];

    let result = pool
        .send_transaction_batch(&sender, txs, BatchOptions::default(), &CancellationToken::new())
        .await;
    assert!(matches!(result.error, Some(PoolError::SubmissionFailed { .. })));
    assert_eq!(result.receipts, vec![None, None]);
    assert_eq!(transport.send_count(), 1);
}

#[tokio::test]
async fn test_batch_retry_budget_is_shared() {
    let chain = MockChain::new(100);
    let (transport, pool) = single_endpoint_pool(&chain);
    transport.fail_sends(RpcError::Transport("connection reset".into()));
    let sender = pool.register_account(account(0x11));

    let options = BatchOptions {
        retry_budget: 2,
        retry_delay: Duration::from_millis(1),
        ..Default::default()
    };
    let result = pool
        .send_transaction_batch(&sender, vec![transfer(&sender, 1)], options, &CancellationToken::new())
        .await;
    assert!(matches!(result.error, Some(PoolError::RetryBudgetExhausted(2))));
    assert_eq!(transport.send_count(), 3);
}

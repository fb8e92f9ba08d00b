//! Endpoint pool integration tests
//!
//! Health classification by head height and selection fairness.

use proptest::prelude::*;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use txflood_core::{Endpoint, EndpointKind, EndpointPool, EndpointPoolConfig, SelectionMode};
use txflood_rpc::MockTransport;

fn endpoint(rpchost: &str, height: u64) -> (Arc<MockTransport>, Arc<Endpoint>) {
    let transport = Arc::new(MockTransport::new());
    transport.set_response("eth_blockNumber", Value::from(format!("0x{:x}", height)));
    let endpoint = Endpoint::with_transport(rpchost, transport.clone())
        .unwrap()
        .with_head_cache_ttl(Duration::ZERO);
    (transport, Arc::new(endpoint))
}

fn pool_of(n: usize) -> EndpointPool {
    let endpoints = (0..n)
        .map(|i| endpoint(&format!("http://node-{}", i), 10).1)
        .collect();
    EndpointPool::new(endpoints, EndpointPoolConfig::default())
}

// ==================== Health Tests ====================

#[tokio::test]
async fn test_trailing_endpoint_within_window_is_good() {
    let (_, a) = endpoint("http://a", 100);
    let (_, b) = endpoint("http://b", 98);
    let (_, c) = endpoint("http://c", 99);
    let pool = EndpointPool::new(vec![a, b, c], EndpointPoolConfig::default());

    let report = pool.probe_health().await;
    assert_eq!(report.max_height, 100);
    assert_eq!(report.good, 3);
    assert_eq!(report.bad, 0);
}

#[tokio::test]
async fn test_endpoint_falling_behind_is_dropped_and_recovers() {
    let (_, a) = endpoint("http://a", 100);
    let (b_transport, b) = endpoint("http://b", 98);
    let (_, c) = endpoint("http://c", 99);
    let pool = EndpointPool::new(vec![a, b, c], EndpointPoolConfig::default());

    b_transport.set_response("eth_blockNumber", Value::from("0x5f"));
    let report = pool.probe_health().await;
    assert_eq!(report.good, 2);
    assert_eq!(report.bad, 1);
    assert!(pool.good_endpoints().iter().all(|e| e.url() != "http://b"));

    b_transport.set_response("eth_blockNumber", Value::from("0x64"));
    let report = pool.probe_health().await;
    assert_eq!(report.good, 3);
}

#[tokio::test]
async fn test_wider_window_keeps_laggard() {
    let (_, a) = endpoint("http://a", 100);
    let (_, b) = endpoint("http://b", 95);
    let config = EndpointPoolConfig {
        good_height_window: 5,
        ..Default::default()
    };
    let pool = EndpointPool::new(vec![a, b], config);
    assert_eq!(pool.probe_health().await.good, 2);
}

// ==================== Selection Tests ====================

#[test]
fn test_by_index_wraps() {
    let pool = pool_of(3);
    let first = pool.select(SelectionMode::ByIndex(0), "", &[]).unwrap();
    let wrapped = pool.select(SelectionMode::ByIndex(3), "", &[]).unwrap();
    assert!(Arc::ptr_eq(&first, &wrapped));
}

#[test]
fn test_excluded_kind_never_selected() {
    let (_, client) = endpoint("http://a", 10);
    let (_, builder) = endpoint("type(builder)http://b", 10);
    let pool = EndpointPool::new(vec![client, builder], EndpointPoolConfig::default());
    for _ in 0..20 {
        let picked = pool
            .select(SelectionMode::Random, "*", &[EndpointKind::Builder])
            .unwrap();
        assert_eq!(picked.url(), "http://a");
    }
}

proptest! {
    #[test]
    fn prop_round_robin_visits_each_candidate_once(n in 1usize..8, warmup in 0usize..20) {
        let pool = pool_of(n);
        for _ in 0..warmup {
            pool.select(SelectionMode::RoundRobin, "", &[]);
        }
        let seen: HashSet<String> = (0..n)
            .map(|_| pool.select(SelectionMode::RoundRobin, "", &[]).unwrap().url().to_string())
            .collect();
        prop_assert_eq!(seen.len(), n);
    }
}

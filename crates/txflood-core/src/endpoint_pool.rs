//! Health-checked set of endpoints with group-aware selection

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EndpointPoolConfig;
use crate::endpoint::{Endpoint, EndpointKind};
use crate::supervisor::guarded;
use crate::{PoolError, PoolResult};

/// How [`EndpointPool::select`] picks among matching endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// `index % candidates`
    ByIndex(usize),
    /// Uniformly random
    Random,
    /// Pool-wide rotating cursor
    RoundRobin,
}

/// Outcome of one health probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Highest head seen
    pub max_height: u64,
    /// Endpoints now considered good
    pub good: usize,
    /// Endpoints that answered but trail too far behind
    pub bad: usize,
    /// Endpoints whose probe failed
    pub failed: usize,
}

/// All configured endpoints plus the subset currently considered good
pub struct EndpointPool {
    config: EndpointPoolConfig,
    all: Vec<Arc<Endpoint>>,
    good: RwLock<Arc<Vec<Arc<Endpoint>>>>,
    cursor: Mutex<usize>,
    chain_id: Mutex<Option<u64>>,
}

impl EndpointPool {
    /// Create a pool; every endpoint starts out good until the first probe
    pub fn new(endpoints: Vec<Arc<Endpoint>>, config: EndpointPoolConfig) -> Self {
        let good = Arc::new(endpoints.clone());
        Self {
            config,
            all: endpoints,
            good: RwLock::new(good),
            cursor: Mutex::new(0),
            chain_id: Mutex::new(None),
        }
    }

    /// Connect to every host listed in the config over HTTP
    #[cfg(feature = "http")]
    pub fn from_config(config: EndpointPoolConfig) -> PoolResult<Self> {
        let endpoints = config
            .hosts
            .iter()
            .map(|host| Endpoint::from_rpchost(host, config.request_timeout()).map(Arc::new))
            .collect::<PoolResult<Vec<_>>>()?;
        if endpoints.is_empty() {
            return Err(PoolError::NoEndpoint);
        }
        Ok(Self::new(endpoints, config))
    }

    /// Pool configuration
    pub fn config(&self) -> &EndpointPoolConfig {
        &self.config
    }

    /// Snapshot of every endpoint
    pub fn all_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.all.clone()
    }

    /// Snapshot of the good endpoints
    pub fn good_endpoints(&self) -> Arc<Vec<Arc<Endpoint>>> {
        self.good.read().clone()
    }

    /// Chain id learned during [`EndpointPool::prepare`]
    pub fn chain_id(&self) -> Option<u64> {
        *self.chain_id.lock()
    }

    /// Run the first probe and learn the chain id
    pub async fn prepare(&self) -> PoolResult<u64> {
        let report = self.probe_health().await;
        let endpoint = self
            .good
            .read()
            .first()
            .cloned()
            .ok_or(PoolError::NoHealthyEndpoint)?;
        let chain_id = endpoint.chain_id().await?;
        *self.chain_id.lock() = Some(chain_id);
        info!(
            chain_id,
            good = report.good,
            total = self.all.len(),
            head = report.max_height,
            "endpoint pool ready"
        );
        Ok(chain_id)
    }

    // ==================== Health ====================

    /// Probe every non-builder endpoint and swap in the new good set.
    ///
    /// Builders are never probed; they always count as good and are assigned
    /// the highest probed height. Other endpoints are good when their head is
    /// within `good_height_window` of the highest.
    pub async fn probe_health(&self) -> HealthReport {
        let timeout = self.config.request_timeout();
        let probes = self.all.iter().filter(|e| !e.is_builder()).map(|endpoint| {
            let endpoint = endpoint.clone();
            async move {
                let result = match tokio::time::timeout(timeout, endpoint.head_height()).await {
                    Ok(result) => result,
                    Err(_) => Err(PoolError::Timeout("head probe".into())),
                };
                (endpoint, result)
            }
        });
        let results = join_all(probes).await;

        let mut report = HealthReport::default();
        let mut heights = Vec::with_capacity(results.len());
        for (endpoint, result) in results {
            match result {
                Ok(height) => {
                    report.max_height = report.max_height.max(height);
                    heights.push((endpoint, height));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.name(), error = %e, "health probe failed");
                    report.failed += 1;
                }
            }
        }

        if report.max_height > 0 {
            for builder in self.all.iter().filter(|e| e.is_builder()) {
                builder.assume_head(report.max_height);
            }
        }

        let min_height = report.max_height.saturating_sub(self.config.good_height_window);
        let good: Vec<Arc<Endpoint>> = self
            .all
            .iter()
            .filter(|endpoint| {
                endpoint.is_builder()
                    || heights
                        .iter()
                        .any(|(e, h)| Arc::ptr_eq(e, endpoint) && *h >= min_height)
            })
            .cloned()
            .collect();

        report.good = good.len();
        report.bad = heights.iter().filter(|(_, h)| *h < min_height).count();
        debug!(
            head = report.max_height,
            good = report.good,
            bad = report.bad,
            failed = report.failed,
            "health probe done"
        );
        *self.good.write() = Arc::new(good);
        report
    }

    /// Probe on a fixed cadence until cancelled, retrying sooner after failures
    pub async fn run_health_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let pool = self.clone();
            let report = guarded("health probe", async move { Ok(pool.probe_health().await) }).await;
            let wait = match report {
                Some(report) if report.failed == 0 => self.config.probe_interval(),
                _ => self.config.probe_retry(),
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("health loop stopped");
    }

    // ==================== Selection ====================

    /// Pick a good, enabled endpoint in `group` whose kind is not excluded.
    ///
    /// `""` selects the `default` group and `"*"` matches every group.
    pub fn select(
        &self,
        mode: SelectionMode,
        group: &str,
        exclude: &[EndpointKind],
    ) -> Option<Arc<Endpoint>> {
        let good = self.good.read().clone();
        let mut cursor = self.cursor.lock();

        let candidates: Vec<&Arc<Endpoint>> = good
            .iter()
            .filter(|e| e.is_enabled())
            .filter(|e| group == "*" || e.has_group(group))
            .filter(|e| !exclude.contains(&e.kind()))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let n = candidates.len();
        let index = match mode {
            SelectionMode::ByIndex(i) => i % n,
            SelectionMode::Random => rand::thread_rng().gen_range(0..n),
            SelectionMode::RoundRobin => {
                let i = *cursor % n;
                *cursor = cursor.wrapping_add(1);
                i
            }
        };
        Some(candidates[index].clone())
    }

    /// Random good endpoint from any group
    pub fn any(&self) -> Option<Arc<Endpoint>> {
        self.select(SelectionMode::Random, "*", &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use txflood_rpc::MockTransport;

    fn endpoint(rpchost: &str, height: u64) -> (Arc<MockTransport>, Arc<Endpoint>) {
        let transport = Arc::new(MockTransport::new());
        transport.set_response("eth_blockNumber", Value::from(format!("0x{:x}", height)));
        let endpoint = Endpoint::with_transport(rpchost, transport.clone())
            .unwrap()
            .with_head_cache_ttl(std::time::Duration::ZERO);
        (transport, Arc::new(endpoint))
    }

    #[tokio::test]
    async fn test_builder_is_good_without_probe() {
        let (_, client) = endpoint("http://a", 50);
        let (builder_transport, builder) = endpoint("type(builder)http://b", 0);
        let pool = EndpointPool::new(vec![client, builder.clone()], EndpointPoolConfig::default());
        assert_eq!(builder.last_head().0, 0);

        let report = pool.probe_health().await;
        assert_eq!(report.good, 2);
        assert_eq!(builder_transport.call_count("eth_blockNumber"), 0);
        let (height, fetched) = builder.last_head();
        assert_eq!(height, 50);
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn test_failed_probe_excludes_endpoint() {
        let (_, a) = endpoint("http://a", 10);
        let (b_transport, b) = endpoint("http://b", 10);
        b_transport.set_error(
            "eth_blockNumber",
            txflood_rpc::RpcError::Transport("refused".into()),
        );
        let pool = EndpointPool::new(vec![a, b], EndpointPoolConfig::default());

        let report = pool.probe_health().await;
        assert_eq!(report.failed, 1);
        assert_eq!(pool.good_endpoints().len(), 1);
        assert_eq!(pool.good_endpoints()[0].url(), "http://a");
    }

    #[tokio::test]
    async fn test_select_filters() {
        let (_, a) = endpoint("group(east)http://a", 10);
        let (_, b) = endpoint("group(west)http://b", 10);
        let (_, c) = endpoint("type(builder)group(east)http://c", 10);
        let pool = EndpointPool::new(vec![a.clone(), b, c], EndpointPoolConfig::default());

        let picked = pool
            .select(SelectionMode::ByIndex(0), "east", &[EndpointKind::Builder])
            .unwrap();
        assert_eq!(picked.url(), "http://a");

        a.set_enabled(false);
        assert!(pool
            .select(SelectionMode::Random, "east", &[EndpointKind::Builder])
            .is_none());
        assert!(pool.select(SelectionMode::RoundRobin, "nope", &[]).is_none());
        assert!(pool.select(SelectionMode::ByIndex(7), "", &[]).is_some());
        assert!(pool.any().is_some());
    }

    #[tokio::test]
    async fn test_prepare_fails_without_good_endpoint() {
        let (transport, a) = endpoint("http://a", 10);
        transport.set_error("eth_blockNumber", txflood_rpc::RpcError::Timeout(10));
        let pool = EndpointPool::new(vec![a], EndpointPoolConfig::default());
        assert!(matches!(pool.prepare().await, Err(PoolError::NoHealthyEndpoint)));
    }

    #[tokio::test]
    async fn test_prepare_learns_chain_id() {
        let (transport, a) = endpoint("http://a", 10);
        transport.set_response("eth_chainId", Value::from("0x539"));
        let pool = EndpointPool::new(vec![a], EndpointPoolConfig::default());
        assert_eq!(pool.prepare().await.unwrap(), 1337);
        assert_eq!(pool.chain_id(), Some(1337));
    }
}

//! A single RPC endpoint with cached chain state and request statistics

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use txflood_primitives::{Address, H256, U256};
use txflood_rpc::{BlockId, RpcClient, RpcResult, Transport};
use txflood_types::{Block, Receipt, SignedTransaction};

use crate::{PoolError, PoolResult};

const FEE_CACHE_TTL: Duration = Duration::from_secs(12);
const HEAD_CACHE_TTL: Duration = Duration::from_secs(12);
const VERSION_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Tip used when the node does not implement `eth_maxPriorityFeePerGas`
const FALLBACK_TIP: u128 = 2_000_000_000;

/// Endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EndpointKind {
    /// Regular node
    #[default]
    Client,
    /// Block builder, assumed to always be at the chain head
    Builder,
}

impl FromStr for EndpointKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(EndpointKind::Client),
            "builder" => Ok(EndpointKind::Builder),
            other => Err(PoolError::InvalidEndpoint(format!(
                "invalid endpoint type '{}', supported types: client, builder",
                other
            ))),
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Client => write!(f, "client"),
            EndpointKind::Builder => write!(f, "builder"),
        }
    }
}

/// rpchost string split into its prefixes and URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHost {
    /// Endpoint URL
    pub url: String,
    /// Extra HTTP headers
    pub headers: Vec<(String, String)>,
    /// Group tags, always starting with `default`
    pub groups: Vec<String>,
    /// Display name override
    pub name: Option<String>,
    /// Endpoint role
    pub kind: EndpointKind,
}

impl FromStr for ParsedHost {
    type Err = PoolError;

    /// Parse `headers(K:V|K2:V2)`, `group(a,b)`, `name(x)` and `type(client|builder)`
    /// prefixes, in any order, followed by the URL.
    fn from_str(rpchost: &str) -> Result<Self, Self::Err> {
        let mut rest = rpchost.trim();
        let mut parsed = ParsedHost {
            url: String::new(),
            headers: Vec::new(),
            groups: vec!["default".to_string()],
            name: None,
            kind: EndpointKind::Client,
        };

        loop {
            let Some((prefix, inner, tail)) = split_prefix(rest)? else {
                break;
            };
            match prefix {
                "headers" => {
                    for pair in inner.split('|').filter(|p| !p.trim().is_empty()) {
                        let (key, value) = pair.split_once(':').ok_or_else(|| {
                            PoolError::InvalidEndpoint(format!("malformed header '{}'", pair))
                        })?;
                        parsed
                            .headers
                            .push((key.trim().to_string(), value.trim().to_string()));
                    }
                }
                "group" => {
                    for group in inner.split(',') {
                        push_group(&mut parsed.groups, group);
                    }
                }
                "name" => parsed.name = Some(inner.to_string()),
                "type" => parsed.kind = inner.parse()?,
                _ => break,
            }
            rest = tail;
        }

        if rest.is_empty() {
            return Err(PoolError::InvalidEndpoint(format!(
                "missing url in '{}'",
                rpchost
            )));
        }
        parsed.url = rest.to_string();
        Ok(parsed)
    }
}

/// Split `prefix(inner)tail`; `None` if `s` does not start with a known prefix
fn split_prefix(s: &str) -> PoolResult<Option<(&str, &str, &str)>> {
    for prefix in ["headers", "group", "name", "type"] {
        let Some(after) = s.strip_prefix(prefix).and_then(|r| r.strip_prefix('(')) else {
            continue;
        };
        let end = after.find(')').ok_or_else(|| {
            PoolError::InvalidEndpoint(format!("unclosed {}( in '{}'", prefix, s))
        })?;
        return Ok(Some((prefix, &after[..end], &after[end + 1..])));
    }
    Ok(None)
}

fn push_group(groups: &mut Vec<String>, group: &str) {
    let group = group.trim();
    if !group.is_empty() && !groups.iter().any(|g| g == group) {
        groups.push(group.to_string());
    }
}

/// Host part of a URL, used as the default display name
fn url_host(url: &str) -> &str {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    authority.rsplit('@').next().unwrap_or(authority)
}

/// Request counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// All requests
    pub total: u64,
    /// Transaction submissions
    pub transactions: u64,
    /// Failed requests
    pub failures: u64,
}

#[derive(Clone, Copy)]
struct FeeCache {
    fetched: Instant,
    fee_cap: u128,
    tip: u128,
}

#[derive(Clone, Copy, Default)]
struct HeadCache {
    height: u64,
    fetched: Option<Instant>,
}

/// One RPC connection
pub struct Endpoint {
    url: String,
    kind: EndpointKind,
    client: RpcClient,
    groups: RwLock<Vec<String>>,
    name_override: RwLock<Option<String>>,
    enabled: AtomicBool,
    chain_id: Mutex<Option<u64>>,
    fees: Mutex<Option<FeeCache>>,
    head: Mutex<HeadCache>,
    head_ttl: Duration,
    version: Mutex<Option<(Instant, String)>>,
    total_requests: AtomicU64,
    tx_requests: AtomicU64,
    failures: AtomicU64,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name())
            .field("kind", &self.kind)
            .field("groups", &*self.groups.read())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Endpoint {
    /// Connect over HTTP from an rpchost string
    #[cfg(feature = "http")]
    pub fn from_rpchost(rpchost: &str, timeout: Duration) -> PoolResult<Self> {
        let parsed: ParsedHost = rpchost.parse()?;
        let transport = txflood_rpc::HttpTransport::new(&parsed.url, &parsed.headers, timeout)?;
        Ok(Self::from_parts(parsed, Arc::new(transport)))
    }

    /// Build from an rpchost string over a caller-supplied transport
    pub fn with_transport(rpchost: &str, transport: Arc<dyn Transport>) -> PoolResult<Self> {
        let parsed: ParsedHost = rpchost.parse()?;
        Ok(Self::from_parts(parsed, transport))
    }

    fn from_parts(parsed: ParsedHost, transport: Arc<dyn Transport>) -> Self {
        Self {
            url: parsed.url,
            kind: parsed.kind,
            client: RpcClient::new(transport),
            groups: RwLock::new(parsed.groups),
            name_override: RwLock::new(parsed.name),
            enabled: AtomicBool::new(true),
            chain_id: Mutex::new(None),
            fees: Mutex::new(None),
            head: Mutex::new(HeadCache::default()),
            head_ttl: HEAD_CACHE_TTL,
            version: Mutex::new(None),
            total_requests: AtomicU64::new(0),
            tx_requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Override how long a fetched head height is served from cache
    pub fn with_head_cache_ttl(mut self, ttl: Duration) -> Self {
        self.head_ttl = ttl;
        self
    }

    // ==================== Identity ====================

    /// Endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Display name: the override if set, else the URL host
    pub fn name(&self) -> String {
        match &*self.name_override.read() {
            Some(name) if !name.is_empty() => name.clone(),
            _ => url_host(&self.url).to_string(),
        }
    }

    /// Set or clear the display name override
    pub fn set_name_override(&self, name: Option<String>) {
        *self.name_override.write() = name;
    }

    /// Endpoint role
    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// True for builder endpoints
    pub fn is_builder(&self) -> bool {
        self.kind == EndpointKind::Builder
    }

    /// Group tags
    pub fn groups(&self) -> Vec<String> {
        self.groups.read().clone()
    }

    /// Replace the group tags; blanks and duplicates are dropped
    pub fn set_groups<S: AsRef<str>>(&self, groups: &[S]) {
        let mut unique = Vec::new();
        for group in groups {
            push_group(&mut unique, group.as_ref());
        }
        *self.groups.write() = unique;
    }

    /// Group membership; `""` means `default`
    pub fn has_group(&self, group: &str) -> bool {
        let group = if group.is_empty() { "default" } else { group };
        self.groups.read().iter().any(|g| g == group)
    }

    /// Whether the endpoint takes part in selection
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enable or disable selection of this endpoint
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Request counters
    pub fn stats(&self) -> RequestStats {
        RequestStats {
            total: self.total_requests.load(Ordering::Relaxed),
            transactions: self.tx_requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn record<T>(&self, is_tx: bool, result: RpcResult<T>) -> PoolResult<T> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if is_tx {
            self.tx_requests.fetch_add(1, Ordering::Relaxed);
        }
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        result.map_err(PoolError::from)
    }

    // ==================== Chain State ====================

    /// Chain id, fetched once
    pub async fn chain_id(&self) -> PoolResult<u64> {
        if let Some(id) = *self.chain_id.lock() {
            return Ok(id);
        }
        let id = self.record(false, self.client.chain_id().await)?;
        *self.chain_id.lock() = Some(id);
        Ok(id)
    }

    /// Suggested `(fee_cap, tip)`, cached for 12s
    pub async fn suggested_fees(&self) -> PoolResult<(u128, u128)> {
        if let Some(cache) = *self.fees.lock() {
            if cache.fetched.elapsed() < FEE_CACHE_TTL {
                return Ok((cache.fee_cap, cache.tip));
            }
        }

        let fee_cap = self.record(false, self.client.gas_price().await)?;
        let tip = match self.record(false, self.client.max_priority_fee_per_gas().await) {
            Ok(tip) => tip,
            Err(_) => FALLBACK_TIP,
        };
        *self.fees.lock() = Some(FeeCache {
            fetched: Instant::now(),
            fee_cap,
            tip,
        });
        Ok((fee_cap, tip))
    }

    /// Head height, served from cache while the last increase is recent,
    /// otherwise fetched
    pub async fn head_height(&self) -> PoolResult<u64> {
        {
            let head = self.head.lock();
            if let Some(fetched) = head.fetched {
                if fetched.elapsed() < self.head_ttl {
                    return Ok(head.height);
                }
            }
        }
        self.fetch_head().await
    }

    /// Head height straight from the node; the cached value only moves forward
    pub async fn fetch_head(&self) -> PoolResult<u64> {
        trace!(endpoint = %self.name(), "get block number");
        let height = self.record(false, self.client.block_number().await)?;
        let mut head = self.head.lock();
        if height > head.height || head.fetched.is_none() {
            head.height = head.height.max(height);
            head.fetched = Some(Instant::now());
        }
        Ok(height)
    }

    /// Record a head height learned without querying this node
    pub(crate) fn assume_head(&self, height: u64) {
        let mut head = self.head.lock();
        head.height = head.height.max(height);
        head.fetched = Some(Instant::now());
    }

    /// Last cached head height and when it was fetched
    pub fn last_head(&self) -> (u64, Option<Instant>) {
        let head = self.head.lock();
        (head.height, head.fetched)
    }

    /// Node version string, cached for 30 minutes
    pub async fn client_version(&self) -> PoolResult<String> {
        if let Some((fetched, version)) = &*self.version.lock() {
            if fetched.elapsed() < VERSION_CACHE_TTL {
                return Ok(version.clone());
            }
        }
        let version = self.record(false, self.client.client_version().await)?;
        *self.version.lock() = Some((Instant::now(), version.clone()));
        Ok(version)
    }

    // ==================== Account Queries ====================

    /// Confirmed transaction count of an address
    pub async fn nonce_at(&self, address: &Address) -> PoolResult<u64> {
        self.record(false, self.client.nonce_at(address, BlockId::Latest).await)
    }

    /// Transaction count of an address as of a block height
    pub async fn nonce_at_height(&self, address: &Address, height: u64) -> PoolResult<u64> {
        self.record(false, self.client.nonce_at(address, BlockId::Number(height)).await)
    }

    /// Transaction count including the node's mempool
    pub async fn pending_nonce(&self, address: &Address) -> PoolResult<u64> {
        self.record(false, self.client.nonce_at(address, BlockId::Pending).await)
    }

    /// Latest balance of an address
    pub async fn balance(&self, address: &Address) -> PoolResult<U256> {
        self.record(false, self.client.balance(address, BlockId::Latest).await)
    }

    // ==================== Transactions ====================

    /// Submit a signed transaction
    pub async fn send_transaction(&self, tx: &SignedTransaction) -> PoolResult<()> {
        trace!(endpoint = %self.name(), tx = %tx.hash(), "submit transaction");
        self.send_raw(&tx.encode()).await
    }

    /// Submit pre-encoded transaction bytes
    pub async fn send_raw(&self, raw: &[u8]) -> PoolResult<()> {
        self.record(true, self.client.send_raw_transaction(raw).await)
            .map(|_| ())
    }

    /// Transaction receipt, `None` while unknown
    pub async fn receipt(&self, hash: &H256) -> PoolResult<Option<Receipt>> {
        trace!(endpoint = %self.name(), tx = %hash, "get receipt");
        self.record(false, self.client.receipt(hash).await)
    }

    // ==================== Blocks ====================

    /// Block body with full transactions
    pub async fn block(&self, number: u64) -> PoolResult<Block> {
        self.record(false, self.client.block_by_number(number).await)?
            .ok_or(PoolError::BlockUnavailable(number))
    }

    /// All receipts of a block
    pub async fn block_receipts(&self, number: u64) -> PoolResult<Vec<Receipt>> {
        self.record(false, self.client.block_receipts(number).await)?
            .ok_or(PoolError::BlockUnavailable(number))
    }
}

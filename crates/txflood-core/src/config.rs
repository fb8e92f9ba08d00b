//! Pool configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Endpoint pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointPoolConfig {
    /// rpchost strings, see [`crate::Endpoint::from_rpchost`]
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Seconds between health probes
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Seconds until the next probe after a failed one
    #[serde(default = "default_probe_retry_secs")]
    pub probe_retry_secs: u64,
    /// Blocks an endpoint may trail the highest head and still count as good
    #[serde(default = "default_good_height_window")]
    pub good_height_window: u64,
    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_probe_interval_secs() -> u64 {
    120
}

fn default_probe_retry_secs() -> u64 {
    10
}

fn default_good_height_window() -> u64 {
    2
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for EndpointPoolConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_retry_secs: default_probe_retry_secs(),
            good_height_window: default_good_height_window(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl EndpointPoolConfig {
    /// Interval between healthy probes
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Interval after a failed probe
    pub fn probe_retry(&self) -> Duration {
        Duration::from_secs(self.probe_retry_secs)
    }

    /// HTTP request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Transaction pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPoolConfig {
    /// Head polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout for head queries in milliseconds
    #[serde(default = "default_head_timeout_ms")]
    pub head_timeout_ms: u64,
    /// Timeout for block and receipt fetches in milliseconds
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Number of recent blocks kept for reorg detection
    #[serde(default = "default_reorg_depth")]
    pub reorg_depth: u64,
    /// Startup head above which history is skipped
    #[serde(default = "default_history_skip_threshold")]
    pub history_skip_threshold: u64,
    /// Blocks without confirmation before an account is swept
    #[serde(default = "default_stale_threshold_blocks")]
    pub stale_threshold_blocks: u64,
    /// Attempts at reading the on-chain nonce during a sweep
    #[serde(default = "default_stale_nonce_retries")]
    pub stale_nonce_retries: u32,
    /// Receipt polling attempts when no resolution handle applies
    #[serde(default = "default_receipt_poll_retries")]
    pub receipt_poll_retries: u32,
    /// Delay between receipt polls in milliseconds
    #[serde(default = "default_receipt_poll_delay_ms")]
    pub receipt_poll_delay_ms: u64,
    /// First stale rebroadcast delay in seconds
    #[serde(default = "default_stale_rebroadcast_base_secs")]
    pub stale_rebroadcast_base_secs: u64,
    /// Growth factor of the stale rebroadcast delay
    #[serde(default = "default_stale_rebroadcast_factor")]
    pub stale_rebroadcast_factor: f64,
    /// Cap on the stale rebroadcast delay in seconds
    #[serde(default = "default_stale_rebroadcast_max_secs")]
    pub stale_rebroadcast_max_secs: u64,
    /// Rebroadcast interval for reorged transactions in seconds
    #[serde(default = "default_reorg_rebroadcast_interval_secs")]
    pub reorg_rebroadcast_interval_secs: u64,
    /// Rebroadcast attempts for reorged transactions
    #[serde(default = "default_reorg_max_rebroadcasts")]
    pub reorg_max_rebroadcasts: u32,
    /// Capacity of the block statistics broadcast channel
    #[serde(default = "default_subscription_capacity")]
    pub subscription_capacity: usize,
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_head_timeout_ms() -> u64 {
    3_000
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

fn default_reorg_depth() -> u64 {
    10
}

fn default_history_skip_threshold() -> u64 {
    10
}

fn default_stale_threshold_blocks() -> u64 {
    10
}

fn default_stale_nonce_retries() -> u32 {
    3
}

fn default_receipt_poll_retries() -> u32 {
    5
}

fn default_receipt_poll_delay_ms() -> u64 {
    1_000
}

fn default_stale_rebroadcast_base_secs() -> u64 {
    20
}

fn default_stale_rebroadcast_factor() -> f64 {
    1.5
}

fn default_stale_rebroadcast_max_secs() -> u64 {
    300
}

fn default_reorg_rebroadcast_interval_secs() -> u64 {
    30
}

fn default_reorg_max_rebroadcasts() -> u32 {
    10
}

fn default_subscription_capacity() -> usize {
    64
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            head_timeout_ms: default_head_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            reorg_depth: default_reorg_depth(),
            history_skip_threshold: default_history_skip_threshold(),
            stale_threshold_blocks: default_stale_threshold_blocks(),
            stale_nonce_retries: default_stale_nonce_retries(),
            receipt_poll_retries: default_receipt_poll_retries(),
            receipt_poll_delay_ms: default_receipt_poll_delay_ms(),
            stale_rebroadcast_base_secs: default_stale_rebroadcast_base_secs(),
            stale_rebroadcast_factor: default_stale_rebroadcast_factor(),
            stale_rebroadcast_max_secs: default_stale_rebroadcast_max_secs(),
            reorg_rebroadcast_interval_secs: default_reorg_rebroadcast_interval_secs(),
            reorg_max_rebroadcasts: default_reorg_max_rebroadcasts(),
            subscription_capacity: default_subscription_capacity(),
        }
    }
}

impl TxPoolConfig {
    /// Head polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Head query timeout
    pub fn head_timeout(&self) -> Duration {
        Duration::from_millis(self.head_timeout_ms)
    }

    /// Block and receipt fetch timeout
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Delay between receipt polls
    pub fn receipt_poll_delay(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_delay_ms)
    }

    /// Rebroadcast interval for reorged transactions
    pub fn reorg_rebroadcast_interval(&self) -> Duration {
        Duration::from_secs(self.reorg_rebroadcast_interval_secs)
    }

    /// Delay before the `n`th stale rebroadcast: `base * factor^n`, capped
    pub fn stale_rebroadcast_backoff(&self, n: u32) -> Duration {
        let base = self.stale_rebroadcast_base_secs as f64;
        let secs = base * self.stale_rebroadcast_factor.powi(n as i32);
        let capped = secs.min(self.stale_rebroadcast_max_secs as f64);
        Duration::from_secs_f64(capped.max(0.0))
    }
}

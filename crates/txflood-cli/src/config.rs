//! Configuration file handling for txflood

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use txflood_core::{EndpointPoolConfig, TxPoolConfig};

use crate::cli::Cli;

/// Full configuration: file contents with CLI overrides applied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Endpoint pool settings
    #[serde(default)]
    pub endpoints: EndpointPoolConfig,
    /// Transaction pool settings
    #[serde(default)]
    pub txpool: TxPoolConfig,
    /// Flood run settings
    #[serde(default)]
    pub flood: FloodConfig,
}

/// What to send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloodConfig {
    /// Sender private key (hex)
    #[serde(default)]
    pub privkey: Option<String>,
    /// Transactions to send
    #[serde(default = "default_count")]
    pub count: usize,
    /// Wei transferred per transaction
    #[serde(default)]
    pub value: u64,
    /// Unconfirmed transactions allowed at once
    #[serde(default = "default_pending_limit")]
    pub pending_limit: usize,
    /// Resubmissions allowed after rejected submissions
    #[serde(default = "default_retry_budget")]
    pub retry_budget: usize,
    /// Seconds between rebroadcasts of an unconfirmed transaction
    #[serde(default = "default_rebroadcast_interval_secs")]
    pub rebroadcast_interval_secs: u64,
    /// Rebroadcasts per transaction
    #[serde(default = "default_max_rebroadcasts")]
    pub max_rebroadcasts: u32,
    /// Seconds between progress reports
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

fn default_count() -> usize {
    100
}

fn default_pending_limit() -> usize {
    50
}

fn default_retry_budget() -> usize {
    10
}

fn default_rebroadcast_interval_secs() -> u64 {
    30
}

fn default_max_rebroadcasts() -> u32 {
    5
}

fn default_progress_interval_secs() -> u64 {
    10
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            privkey: None,
            count: default_count(),
            value: 0,
            pending_limit: default_pending_limit(),
            retry_budget: default_retry_budget(),
            rebroadcast_interval_secs: default_rebroadcast_interval_secs(),
            max_rebroadcasts: default_max_rebroadcasts(),
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

impl Config {
    /// Parse a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load the file named on the command line, if any, and apply the flags
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_overrides(cli);
        Ok(config)
    }

    fn apply_overrides(&mut self, cli: &Cli) {
        if !cli.rpchosts.is_empty() {
            self.endpoints.hosts = cli.rpchosts.clone();
        }
        if let Some(key) = &cli.privkey {
            self.flood.privkey = Some(key.clone());
        }
        if let Some(count) = cli.count {
            self.flood.count = count;
        }
        if let Some(limit) = cli.pending_limit {
            self.flood.pending_limit = limit;
        }
    }
}

//! CLI argument parsing for txflood

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Flood an EVM chain with self-transfers across redundant RPC endpoints
#[derive(Parser, Debug, Clone)]
#[command(name = "txflood")]
#[command(about = "Flood an EVM chain with transactions")]
#[command(version)]
pub struct Cli {
    /// TOML config file with [endpoints], [txpool] and [flood] tables
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// RPC host, repeatable; may carry group(..), name(..), type(..) and headers(..) prefixes
    #[arg(long = "rpchost")]
    pub rpchosts: Vec<String>,

    /// Sender private key (hex)
    #[arg(long)]
    pub privkey: Option<String>,

    /// Number of transactions to send
    #[arg(long)]
    pub count: Option<usize>,

    /// Unconfirmed transactions allowed at once
    #[arg(long)]
    pub pending_limit: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

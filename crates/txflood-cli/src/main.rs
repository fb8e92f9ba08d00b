//! # txflood
//!
//! Sends a stream of self-transfers through a pool of RPC endpoints and
//! tracks every one of them to inclusion, surviving chain reorganizations.
//!
//! ## Usage
//!
//! ```bash
//! txflood --rpchost http://127.0.0.1:8545 --privkey 0x... --count 1000
//! txflood --config flood.toml --log-format json
//! ```

mod cli;
mod config;
mod flood;

use anyhow::Result;
use cli::{Cli, LogFormat};
use config::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_tracing(&cli.log_level, cli.log_format);

    let config = Config::from_cli(&cli)?;
    tracing::info!(endpoints = config.endpoints.hosts.len(), "txflood starting");

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        stop.cancel();
    });

    flood::run(config, cancel).await
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

//! Command-line interface configuration

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::AppConfig;

/// Bitcoin Oracle daemon CLI
///
/// Flags left unset keep the value from the configuration file and
/// environment.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    // Bitcoin RPC options
    /// Bitcoin Core RPC URL
    #[arg(long)]
    pub rpc_url: Option<String>,

    /// Bitcoin Core RPC username
    #[arg(long)]
    pub rpc_username: Option<String>,

    /// Bitcoin Core RPC password
    #[arg(long)]
    pub rpc_password: Option<String>,

    /// Path to Bitcoin Core cookie file (alternative to username/password)
    #[arg(long)]
    pub rpc_cookie_file: Option<String>,

    // Estimation
    /// Blocks in the rolling window
    #[arg(long)]
    pub window_blocks: Option<usize>,

    /// Blocks loaded below the tip at startup
    #[arg(long)]
    pub backfill_blocks: Option<u32>,

    // Collection settings
    /// Tip polling interval in seconds
    #[arg(long)]
    pub interval_secs: Option<u64>,

    /// Interval between status lines in seconds
    #[arg(long, default_value_t = 60)]
    pub status_interval_secs: u64,

    // Test mode
    /// Follow a synthetic ledger instead of a node
    #[arg(long)]
    pub test_mode: bool,

    /// BTC/USD price the synthetic ledger pays at
    #[arg(long, default_value_t = 95_000.0)]
    pub mock_price: f64,

    // Logging
    /// Log filter (e.g., "bitcoin_oracle_daemon=debug,bitcoin_oracle=info")
    #[arg(long, default_value = "bitcoin_oracle_daemon=info,bitcoin_oracle=info")]
    pub log_filter: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Path to configuration file (overridden by CLI args)
    #[arg(short, long)]
    pub config: Option<String>,
}

impl Cli {
    /// Loads the configuration this invocation points at, with flags applied.
    pub fn load_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_file(path).with_context(|| format!("Failed to load configuration from {path}"))?,
            None => AppConfig::load().context("Failed to load configuration")?,
        };
        self.apply(&mut config)?;
        Ok(config)
    }

    /// Overrides configuration values with the flags that were given.
    pub fn apply(&self, config: &mut AppConfig) -> Result<()> {
        if let Some(url) = &self.rpc_url {
            config.bitcoin_rpc.url = url.clone();
        }
        if let Some(username) = &self.rpc_username {
            config.bitcoin_rpc.username = username.clone();
        }
        if let Some(password) = &self.rpc_password {
            config.bitcoin_rpc.password = password.clone();
        }
        if let Some(cookie_file) = &self.rpc_cookie_file {
            config.bitcoin_rpc.cookie_file = Some(cookie_file.clone());
        }
        if let Some(cookie_file) = &config.bitcoin_rpc.cookie_file {
            let (username, password) = read_cookie_file(cookie_file)?;
            config.bitcoin_rpc.username = username;
            config.bitcoin_rpc.password = password;
        }

        if let Some(window_blocks) = self.window_blocks {
            config.estimator.window_blocks = window_blocks;
        }
        if let Some(backfill_blocks) = self.backfill_blocks {
            config.ingestion.backfill_blocks = backfill_blocks;
        }
        if let Some(interval_secs) = self.interval_secs {
            config.ingestion.poll_interval_ms = interval_secs * 1_000;
        }
        Ok(())
    }
}

/// Read Bitcoin Core cookie file and extract credentials
pub fn read_cookie_file(path: &str) -> Result<(String, String)> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("Failed to read cookie file: {path}"))?;
    let (username, password) = contents
        .trim()
        .split_once(':')
        .context("Invalid cookie file format (expected username:password)")?;
    if username.is_empty() || password.contains(':') {
        anyhow::bail!("Invalid cookie file format (expected username:password)");
    }
    Ok((username.to_string(), password.to_string()))
}

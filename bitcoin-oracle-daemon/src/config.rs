use bitcoin_oracle::{BaselineConfig, EstimatorConfig};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub bitcoin_rpc: BitcoinRpcConfig,
    pub estimator: EstimatorSettings,
    pub ingestion: IngestionConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
}

/// Bitcoin RPC configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BitcoinRpcConfig {
    /// RPC URL (default: http://localhost:8332)
    pub url: String,
    /// RPC username
    pub username: String,
    /// RPC password
    pub password: String,
    /// Cookie file to read credentials from instead
    pub cookie_file: Option<String>,
}

impl Default for BitcoinRpcConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8332".to_string(),
            username: String::new(),
            password: String::new(),
            cookie_file: None,
        }
    }
}

/// Rolling window and price search settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EstimatorSettings {
    /// Blocks in the rolling window (default: 144)
    pub window_blocks: usize,
    /// Blocks needed before estimating (default: 10)
    pub min_blocks: usize,
    /// Half-width of the reported band (default: 0.05)
    pub band_pct: f64,
    /// Lowest plausible price in USD (default: 10000)
    pub min_price: f64,
    /// Highest plausible price in USD (default: 500000)
    pub max_price: f64,
    /// Matching tolerance in histogram bins (default: 2)
    pub tolerance_bins: i32,
}

impl Default for EstimatorSettings {
    fn default() -> Self {
        Self {
            window_blocks: 144,
            min_blocks: 10,
            band_pct: 0.05,
            min_price: 10_000.0,
            max_price: 500_000.0,
            tolerance_bins: 2,
        }
    }
}

/// Block ingestion configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IngestionConfig {
    /// Tip polling interval in milliseconds (default: 30000)
    pub poll_interval_ms: u64,
    /// Blocks buffered between feed and tracker (default: 16)
    pub queue_capacity: usize,
    /// Blocks loaded below the tip at startup (default: 144)
    pub backfill_blocks: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            queue_capacity: 16,
            backfill_blocks: 144,
        }
    }
}

/// Retry configuration for node requests
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts per request, the first one included (default: 5)
    pub max_attempts: u32,
    /// Delay before the first retry (default: 500)
    pub initial_delay_ms: u64,
    /// Longest delay between retries (default: 30000)
    pub max_delay_ms: u64,
    /// Growth factor per retry (default: 2.0)
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// Price cache configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CacheConfig {
    /// Seconds a published price stays fresh (default: 1800)
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 1_800 }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;

        // Load from config file if specified via environment variable
        if let Ok(config_file) = std::env::var("ORACLE_CONFIG_FILE") {
            builder = builder.add_source(File::from(Path::new(&config_file)));
        } else {
            // Try to load default config files
            builder = builder
                .add_source(File::with_name("config/default").required(false))
                .add_source(File::with_name("config").required(false));
        }

        Self::with_environment(builder)
    }

    /// Load configuration from a specific file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let builder = Self::defaults()?.add_source(File::from(path.as_ref()));
        Self::with_environment(builder)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let rpc = BitcoinRpcConfig::default();
        let estimator = EstimatorSettings::default();
        let ingestion = IngestionConfig::default();
        let retry = RetryConfig::default();

        Config::builder()
            .set_default("bitcoin_rpc.url", rpc.url)?
            .set_default("bitcoin_rpc.username", rpc.username)?
            .set_default("bitcoin_rpc.password", rpc.password)?
            .set_default("estimator.window_blocks", estimator.window_blocks as u64)?
            .set_default("estimator.min_blocks", estimator.min_blocks as u64)?
            .set_default("estimator.band_pct", estimator.band_pct)?
            .set_default("estimator.min_price", estimator.min_price)?
            .set_default("estimator.max_price", estimator.max_price)?
            .set_default("estimator.tolerance_bins", estimator.tolerance_bins as i64)?
            .set_default("ingestion.poll_interval_ms", ingestion.poll_interval_ms)?
            .set_default("ingestion.queue_capacity", ingestion.queue_capacity as u64)?
            .set_default("ingestion.backfill_blocks", ingestion.backfill_blocks as u64)?
            .set_default("retry.max_attempts", retry.max_attempts as u64)?
            .set_default("retry.initial_delay_ms", retry.initial_delay_ms)?
            .set_default("retry.max_delay_ms", retry.max_delay_ms)?
            .set_default("retry.multiplier", retry.multiplier)?
            .set_default("cache.ttl_secs", CacheConfig::default().ttl_secs)
    }

    /// Applies `ORACLE_` variables, with `__` between nested keys
    /// (`ORACLE_ESTIMATOR__WINDOW_BLOCKS`), then the `BITCOIN_RPC_*`
    /// credential variables.
    fn with_environment(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let builder = builder
            .add_source(
                Environment::with_prefix("ORACLE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("bitcoin_rpc.url", std::env::var("BITCOIN_RPC_URL").ok())?
            .set_override_option("bitcoin_rpc.username", std::env::var("BITCOIN_RPC_USERNAME").ok())?
            .set_override_option("bitcoin_rpc.password", std::env::var("BITCOIN_RPC_PASSWORD").ok())?
            .set_override_option("bitcoin_rpc.cookie_file", std::env::var("BITCOIN_RPC_COOKIE_FILE").ok())?;

        builder.build()?.try_deserialize()
    }

    /// Convert to Bitcoin RPC config for the RPC client
    pub fn to_bitcoin_rpc_config(&self) -> crate::bitcoin::BitcoinRpcConfig {
        crate::bitcoin::BitcoinRpcConfig {
            url: self.bitcoin_rpc.url.clone(),
            username: self.bitcoin_rpc.username.clone(),
            password: self.bitcoin_rpc.password.clone(),
        }
    }

    /// Calculator settings; everything not exposed here keeps its default.
    pub fn to_baseline_config(&self) -> BaselineConfig {
        let estimator = &self.estimator;
        BaselineConfig {
            window_blocks: estimator.window_blocks,
            min_blocks: estimator.min_blocks,
            band_pct: estimator.band_pct,
            estimator: EstimatorConfig {
                min_price: estimator.min_price,
                max_price: estimator.max_price,
                tolerance_bins: estimator.tolerance_bins,
                ..EstimatorConfig::default()
            },
            ..BaselineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::env;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.bitcoin_rpc.url, "http://localhost:8332");
        assert_eq!(config.bitcoin_rpc.cookie_file, None);
        assert_eq!(config.estimator.window_blocks, 144);
        assert_eq!(config.ingestion.queue_capacity, 16);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.cache.ttl_secs, 1_800);
    }

    #[test]
    #[serial]
    fn test_load_matches_defaults() {
        let loaded = AppConfig::load().unwrap();
        let defaults = AppConfig::default();
        assert_eq!(loaded.estimator, defaults.estimator);
        assert_eq!(loaded.ingestion, defaults.ingestion);
        assert_eq!(loaded.retry, defaults.retry);
        assert_eq!(loaded.cache, defaults.cache);
    }

    #[test]
    #[serial]
    fn test_env_override() {
        env::set_var("ORACLE_ESTIMATOR__WINDOW_BLOCKS", "72");
        env::set_var("ORACLE_RETRY__MULTIPLIER", "1.5");
        env::set_var("ORACLE_BITCOIN_RPC__USERNAME", "oracleuser");

        let config = AppConfig::load();

        env::remove_var("ORACLE_ESTIMATOR__WINDOW_BLOCKS");
        env::remove_var("ORACLE_RETRY__MULTIPLIER");
        env::remove_var("ORACLE_BITCOIN_RPC__USERNAME");

        let config = config.unwrap();
        assert_eq!(config.estimator.window_blocks, 72);
        assert_eq!(config.retry.multiplier, 1.5);
        assert_eq!(config.bitcoin_rpc.username, "oracleuser");
    }

    #[test]
    #[serial]
    fn test_bitcoin_rpc_env() {
        env::set_var("BITCOIN_RPC_USERNAME", "btcuser");
        env::set_var("BITCOIN_RPC_PASSWORD", "btcpass");
        env::set_var("BITCOIN_RPC_COOKIE_FILE", "/tmp/.cookie");

        let config = AppConfig::load();

        env::remove_var("BITCOIN_RPC_USERNAME");
        env::remove_var("BITCOIN_RPC_PASSWORD");
        env::remove_var("BITCOIN_RPC_COOKIE_FILE");

        let config = config.unwrap();
        assert_eq!(config.bitcoin_rpc.username, "btcuser");
        assert_eq!(config.bitcoin_rpc.password, "btcpass");
        assert_eq!(config.bitcoin_rpc.cookie_file.as_deref(), Some("/tmp/.cookie"));
    }

    #[test]
    #[serial]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "bitcoin_rpc:\n  url: http://node:8332\nestimator:\n  window_blocks: 288\n  max_price: 250000.0\ncache:\n  ttl_secs: 60"
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bitcoin_rpc.url, "http://node:8332");
        assert_eq!(config.estimator.window_blocks, 288);
        assert_eq!(config.estimator.max_price, 250_000.0);
        assert_eq!(config.estimator.min_blocks, 10);
        assert_eq!(config.cache.ttl_secs, 60);
    }

    #[test]
    #[serial]
    fn test_config_file_env_var() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[ingestion]\nqueue_capacity = 4\nbackfill_blocks = 12").unwrap();
        env::set_var("ORACLE_CONFIG_FILE", file.path());

        let config = AppConfig::load();
        env::remove_var("ORACLE_CONFIG_FILE");

        let config = config.unwrap();
        assert_eq!(config.ingestion.queue_capacity, 4);
        assert_eq!(config.ingestion.backfill_blocks, 12);
        assert_eq!(config.ingestion.poll_interval_ms, 30_000);
    }

    #[test]
    fn test_baseline_config_conversion() {
        let mut config = AppConfig::default();
        config.estimator.window_blocks = 48;
        config.estimator.min_price = 20_000.0;

        let baseline = config.to_baseline_config();
        assert_eq!(baseline.window_blocks, 48);
        assert_eq!(baseline.estimator.min_price, 20_000.0);
        assert_eq!(baseline.intraday_chunk_size, 100);
        assert!(baseline.validate().is_ok());
    }
}

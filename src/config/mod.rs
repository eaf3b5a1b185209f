//! Configuration management for price-ingest
//!
//! Loads built-in defaults, optional `config/default` and `config/local`
//! files, then `PRICE_INGEST__*` environment overrides. `.env` is read first.
//! The substreams CLI's own variables (`SUBSTREAMS_ENDPOINT`,
//! `SUBSTREAMS_API_TOKEN`, `SUBSTREAMS_MANIFEST_PATH`,
//! `SUBSTREAMS_START_BLOCK`) seed the streaming defaults.

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::time::Duration;

const ENV_PREFIX: &str = "PRICE_INGEST";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub streaming: StreamingConfig,
    pub pyth: PythConfig,
    pub coingecko: CoinGeckoConfig,
    pub http: HttpConfig,
    pub monitor: MonitorConfig,
    pub rollup: RollupConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

/// First non-empty value among `var_names`
fn resolve_env(var_names: &[&str]) -> Option<String> {
    for var in var_names {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    None
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::defaults(|name| resolve_env(&[name]))?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (PRICE_INGEST__*)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("Failed to build configuration")?;

        Self::from_config(config)
    }

    /// Builder holding every default. `legacy` looks up the substreams CLI
    /// variables, which take precedence over the built-in values only.
    fn defaults(legacy: impl Fn(&str) -> Option<String>) -> Result<ConfigBuilder<DefaultState>> {
        let log_json = legacy("LOG_FORMAT")
            .map(|v| v.trim().eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let builder = Config::builder()
            // Streaming defaults
            .set_default("streaming.enabled", true)?
            .set_default("streaming.binary", "substreams")?
            .set_default(
                "streaming.endpoint",
                legacy("SUBSTREAMS_ENDPOINT")
                    .unwrap_or_else(|| "evm-mainnet.sei.streamingfast.io:443".to_string()),
            )?
            .set_default(
                "streaming.api_token",
                legacy("SUBSTREAMS_API_TOKEN").unwrap_or_default(),
            )?
            .set_default(
                "streaming.manifest_path",
                legacy("SUBSTREAMS_MANIFEST_PATH")
                    .unwrap_or_else(|| "./substreams/substreams.yaml".to_string()),
            )?
            .set_default(
                "streaming.start_block",
                legacy("SUBSTREAMS_START_BLOCK").unwrap_or_else(|| "0".to_string()),
            )?
            .set_default("streaming.module", "store_set_oracle_prices")?
            .set_default("streaming.restart_delay_ms", 5000)?
            .set_default("streaming.probe_timeout_ms", 5000)?
            // REST source defaults
            .set_default("pyth.base_url", "https://hermes.pyth.network")?
            .set_default("pyth.poll_interval_secs", 30)?
            .set_default("coingecko.base_url", "https://api.coingecko.com/api/v3")?
            .set_default("http.timeout_ms", 10_000)?
            // Monitor defaults
            .set_default("monitor.interval_secs", 60)?
            .set_default("monitor.staleness_threshold_secs", 300)?
            // Rollup defaults
            .set_default("rollup.interval_secs", 300)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.seed_tokens", true)?
            // Logging defaults
            .set_default("logging.level", "info")?
            .set_default("logging.json", log_json)?;

        Ok(builder)
    }

    fn from_config(config: Config) -> Result<Self> {
        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("pyth.poll_interval_secs", self.pyth.poll_interval_secs),
            ("monitor.interval_secs", self.monitor.interval_secs),
            ("monitor.staleness_threshold_secs", self.monitor.staleness_threshold_secs),
            ("rollup.interval_secs", self.rollup.interval_secs),
            ("http.timeout_ms", self.http.timeout_ms),
            ("streaming.probe_timeout_ms", self.streaming.probe_timeout_ms),
        ];
        for (key, value) in intervals {
            if value == 0 {
                bail!("{} must be greater than zero", key);
            }
        }

        if i64::try_from(self.monitor.staleness_threshold_secs).is_err() {
            bail!("monitor.staleness_threshold_secs is out of range");
        }
        if self.persistence.data_dir.trim().is_empty() {
            bail!("persistence.data_dir must not be empty");
        }
        if self.streaming.enabled && self.streaming.binary.trim().is_empty() {
            bail!("streaming.binary must be set when streaming is enabled");
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.pyth.poll_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_secs)
    }

    pub fn staleness_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.monitor.staleness_threshold_secs as i64)
    }

    pub fn rollup_interval(&self) -> Duration {
        Duration::from_secs(self.rollup.interval_secs)
    }

    /// One-line summary for the startup log. Never includes credentials.
    pub fn digest(&self) -> String {
        format!(
            "streaming={} endpoint={} token={} start_block={} poll={}s stale>{}s rollup={}s data_dir={}",
            self.streaming.enabled,
            self.streaming.endpoint,
            if self.streaming.api_token.trim().is_empty() { "unset" } else { "set" },
            self.streaming.start_block,
            self.pyth.poll_interval_secs,
            self.monitor.staleness_threshold_secs,
            self.rollup.interval_secs,
            self.persistence.data_dir
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

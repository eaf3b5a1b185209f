//! Configuration section types

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Allow streaming at all; when false the probe is skipped
    pub enabled: bool,
    /// Path or name of the substreams CLI
    pub binary: String,
    pub endpoint: String,
    /// Passed to the child as SUBSTREAMS_API_TOKEN; empty disables streaming
    pub api_token: String,
    pub manifest_path: String,
    /// 0 means "from the manifest's initial block"
    pub start_block: u64,
    /// Output module to run
    pub module: String,
    pub restart_delay_ms: u64,
    pub probe_timeout_ms: u64,
}

impl StreamingConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PythConfig {
    pub base_url: String,
    /// Interval of the REST polling cycle (primary then secondary)
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinGeckoConfig {
    /// API root including the version path segment
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub timeout_ms: u64,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub staleness_threshold_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub data_dir: String,
    /// Seed the default token set into an empty token table
    pub seed_tokens: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Fallback filter when RUST_LOG is unset
    pub level: String,
    pub json: bool,
}

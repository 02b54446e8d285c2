//! Configuration management for the offload engine.
//!
//! Loads configuration from a TOML file. Every section has defaults so a file
//! only needs the `[destinations.*]` tables it actually uses.

use crate::destinations::ProviderConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub purge: PurgeConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Remote destinations keyed by their stable id (e.g. `aws_s3`)
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Block size for chunked uploads in bytes (default: 8MB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Files above this size use the provider's chunked protocol where it has one
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold: u64,

    /// Upper bound for a single HTTP request, in seconds
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// TCP/TLS connect timeout, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Attempts per chunk before the whole upload fails
    #[serde(default = "default_part_retries")]
    pub part_retries: u32,

    /// used/quota ratio at which a storage warning is emitted
    #[serde(default = "default_usage_warning_ratio")]
    pub usage_warning_ratio: f64,

    /// Age after which a cached usage snapshot is refreshed, in seconds
    #[serde(default = "default_usage_cache_ttl_secs")]
    pub usage_cache_ttl_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Delete attempts before an entry is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failure, in seconds
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: i64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Longest delay between attempts, in seconds
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: i64,

    /// Lifetime of the task lock record, in seconds
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: i64,

    /// Cron expression (with seconds) for the periodic purge tick
    #[serde(default = "default_cron")]
    pub cron: String,

    /// Completed durations kept per destination for the SLA history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Most recent durations averaged for the forecast
    #[serde(default = "default_forecast_window")]
    pub forecast_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One configured remote destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Display name; defaults to the provider's name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub provider: ProviderConfig,
}

// Default values
fn default_chunk_size() -> u64 {
    8 * 1024 * 1024 // 8MB
}

fn default_multipart_threshold() -> u64 {
    32 * 1024 * 1024 // 32MB
}

fn default_http_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_part_retries() -> u32 {
    3
}

fn default_usage_warning_ratio() -> f64 {
    0.9
}

fn default_usage_cache_ttl_secs() -> i64 {
    3600
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_secs() -> i64 {
    300
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_cap_secs() -> i64 {
    6 * 3600
}

fn default_lock_ttl_secs() -> i64 {
    600
}

fn default_cron() -> String {
    "0 */15 * * * *".to_string()
}

fn default_history_limit() -> usize {
    50
}

fn default_forecast_window() -> usize {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            multipart_threshold: default_multipart_threshold(),
            http_timeout_secs: default_http_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            part_retries: default_part_retries(),
            usage_warning_ratio: default_usage_warning_ratio(),
            usage_cache_ttl_secs: default_usage_cache_ttl_secs(),
        }
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_cap_secs: default_backoff_cap_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            cron: default_cron(),
            history_limit: default_history_limit(),
            forecast_window: default_forecast_window(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.transfer.chunk_size == 0 {
            anyhow::bail!("transfer.chunk_size must be greater than zero");
        }
        if config.purge.max_attempts == 0 {
            anyhow::bail!("purge.max_attempts must be at least 1");
        }
        Ok(config)
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::pool::{LivelinessCheck, PoolConfig};

/// Pool tuning knobs as they appear in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Target steady-state number of free connections
    #[serde(default = "default_min_available")]
    pub min_available: usize,

    /// Connection age limit in milliseconds; 0 disables age-out
    #[serde(default = "default_max_age")]
    pub max_age: u64,

    /// Liveliness sweep interval in milliseconds; 0 disables the sweep
    #[serde(default = "default_check_time")]
    pub check_time: u64,

    /// Hard cap on total connections; 0 means unbounded
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    /// Max creation attempts per requested connection
    #[serde(default = "default_retry_limit")]
    pub connection_retry_limit: u32,

    /// Liveliness checking mode: off, fast-only, probe
    #[serde(default = "default_liveliness")]
    pub liveliness: String,
}

fn default_min_available() -> usize {
    10
}

fn default_max_age() -> u64 {
    300_000
}

fn default_check_time() -> u64 {
    120_000
}

fn default_max_limit() -> usize {
    200
}

fn default_retry_limit() -> u32 {
    5
}

fn default_liveliness() -> String {
    "probe".to_string()
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_available: default_min_available(),
            max_age: default_max_age(),
            check_time: default_check_time(),
            max_limit: default_max_limit(),
            connection_retry_limit: default_retry_limit(),
            liveliness: default_liveliness(),
        }
    }
}

impl PoolSettings {
    /// Convert to a runtime pool configuration
    pub fn pool_config(&self) -> Result<PoolConfig> {
        let liveliness = LivelinessCheck::from_name(&self.liveliness).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown liveliness mode '{}' (expected off, fast-only, or probe)",
                self.liveliness
            )
        })?;

        Ok(PoolConfig {
            min_available: self.min_available,
            max_age: Duration::from_millis(self.max_age),
            check_time: Duration::from_millis(self.check_time),
            max_limit: self.max_limit,
            connection_retry_limit: self.connection_retry_limit,
            liveliness,
        })
    }
}

/// Configuration for one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSettings {
    /// Pool settings for this shard; falls back to the global pool settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolSettings>,

    /// Opaque settings passed through to the application's connection factory
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Multiplexer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiplexerSettings {
    /// Interval between poll invocations in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named shards, each with its own pool and factory settings
    #[serde(default)]
    pub shards: HashMap<String, ShardSettings>,

    /// Global pool settings, used by shards without their own
    #[serde(default)]
    pub pool: PoolSettings,

    /// Multiplexer settings
    #[serde(default)]
    pub multiplexer: MultiplexerSettings,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self {
            shards: HashMap::new(),
            pool: PoolSettings::default(),
            multiplexer: MultiplexerSettings::default(),
        }
    }

    /// Effective pool settings for a named shard
    pub fn shard_pool_settings(&self, name: &str) -> Option<&PoolSettings> {
        let shard = self.shards.get(name)?;
        Some(shard.pool.as_ref().unwrap_or(&self.pool))
    }

    /// Poll interval as a duration, when configured
    pub fn poll_interval(&self) -> Option<Duration> {
        self.multiplexer.poll_interval.map(Duration::from_millis)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config = serde_yaml::from_str(&content)
        .context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Supported variables:
/// - POOL_MIN_AVAILABLE, POOL_MAX_AGE, POOL_CHECK_TIME, POOL_MAX_LIMIT,
///   POOL_RETRY_LIMIT (numeric pool settings)
/// - POOL_LIVELINESS (off, fast-only, probe)
/// - POOL_SHARDS (comma-separated shard ids, each created with the global
///   pool settings)
/// - MUX_POLL_INTERVAL (poll interval in milliseconds)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    if let Ok(min) = std::env::var("POOL_MIN_AVAILABLE") {
        if let Ok(val) = min.parse() {
            config.pool.min_available = val;
        }
    }

    if let Ok(age) = std::env::var("POOL_MAX_AGE") {
        if let Ok(val) = age.parse() {
            config.pool.max_age = val;
        }
    }

    if let Ok(check) = std::env::var("POOL_CHECK_TIME") {
        if let Ok(val) = check.parse() {
            config.pool.check_time = val;
        }
    }

    if let Ok(limit) = std::env::var("POOL_MAX_LIMIT") {
        if let Ok(val) = limit.parse() {
            config.pool.max_limit = val;
        }
    }

    if let Ok(retries) = std::env::var("POOL_RETRY_LIMIT") {
        if let Ok(val) = retries.parse() {
            config.pool.connection_retry_limit = val;
        }
    }

    if let Ok(liveliness) = std::env::var("POOL_LIVELINESS") {
        config.pool.liveliness = liveliness;
    }

    if let Ok(shards_str) = std::env::var("POOL_SHARDS") {
        let shard_ids: Vec<String> = shards_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if shard_ids.is_empty() {
            anyhow::bail!("POOL_SHARDS contains no valid shard ids");
        }

        for id in shard_ids {
            config.shards.insert(
                id,
                ShardSettings {
                    pool: None,
                    params: HashMap::new(),
                },
            );
        }
    }

    if let Ok(interval) = std::env::var("MUX_POLL_INTERVAL") {
        if let Ok(val) = interval.parse() {
            config.multiplexer.poll_interval = Some(val);
        }
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries to load from a YAML file when a path is given, otherwise falls
/// back to environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    if let Some(path) = config_path {
        load_from_yaml(path)
    } else {
        load_from_env()
    }
}

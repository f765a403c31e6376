use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::error::RetrievalError;

const DEFAULT_POOL_SIZE: usize = 5;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_BUCKET_GRANULARITY_MS: u64 = 500;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 5_000;

/// On-disk configuration shape; every field is optional and falls back to a
/// default during resolution.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub bucket_granularity_ms: Option<u64>,
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,
    #[serde(default)]
    pub cache_root: Option<String>,
}

/// Fully resolved runtime settings for one downloader instance.
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub pool_size: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub bucket_granularity: Duration,
    pub sweep_interval: Duration,
    /// `None` resolves to the user cache directory at construction time.
    pub cache_root: Option<Utf8PathBuf>,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            bucket_granularity: Duration::from_millis(DEFAULT_BUCKET_GRANULARITY_MS),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            cache_root: None,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolves a config file into runtime settings. With no explicit path,
    /// a missing `terra-fetch.json` in the working directory simply yields
    /// the defaults.
    pub fn resolve(path: Option<&str>) -> Result<RetrieverConfig, RetrievalError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("terra-fetch.json"),
        };
        if path.is_none() && !config_path.exists() {
            return Ok(RetrieverConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| RetrievalError::ConfigRead(config_path.display().to_string()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| RetrievalError::ConfigParse(err.to_string()))?;

        Ok(Self::resolve_config(config))
    }

    pub fn resolve_config(config: Config) -> RetrieverConfig {
        let defaults = RetrieverConfig::default();
        RetrieverConfig {
            pool_size: config.pool_size.unwrap_or(defaults.pool_size).max(1),
            connect_timeout: config
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            read_timeout: config
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.read_timeout),
            bucket_granularity: config
                .bucket_granularity_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.bucket_granularity),
            sweep_interval: config
                .sweep_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            cache_root: config.cache_root.map(Utf8PathBuf::from),
        }
    }
}

//! Process configuration read from the environment (and `.env`)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::discovery::{DiscoveryOptions, DEFAULT_PATH};
use crate::errors::{BullpenError, Result};
use crate::store::redis_store::DEFAULT_PREFIX;
use crate::worker::WorkerConfig;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub redis_url: String,
    pub key_prefix: String,
    /// Explicit manifest globs; when set, `path` and `prefix` are ignored
    pub paths: Vec<String>,
    pub path: String,
    pub prefix: Vec<String>,
    pub concurrency: usize,
    pub lease_ms: u64,
    pub poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        Config {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_PREFIX.to_string(),
            paths: Vec::new(),
            path: DEFAULT_PATH.to_string(),
            prefix: Vec::new(),
            concurrency: worker.concurrency,
            lease_ms: worker.lease_duration.as_millis() as u64,
            poll_ms: worker.poll_interval.as_millis() as u64,
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BullpenError::ConfigError(format!("{} must be a number, got {:?}", key, value)))
}

impl Config {
    /// Load `.env` if present, then read `BULLPEN_*` variables
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(url) = lookup("BULLPEN_REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(prefix) = lookup("BULLPEN_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(paths) = lookup("BULLPEN_PATHS") {
            config.paths = split_list(&paths);
        }
        if let Some(path) = lookup("BULLPEN_PATH") {
            config.path = path;
        }
        if let Some(prefix) = lookup("BULLPEN_PREFIX") {
            config.prefix = split_list(&prefix);
        }
        if let Some(value) = lookup("BULLPEN_CONCURRENCY") {
            config.concurrency = parse_number("BULLPEN_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("BULLPEN_LEASE_MS") {
            config.lease_ms = parse_number("BULLPEN_LEASE_MS", &value)?;
        }
        if let Some(value) = lookup("BULLPEN_POLL_MS") {
            config.poll_ms = parse_number("BULLPEN_POLL_MS", &value)?;
        }

        if config.concurrency == 0 {
            return Err(BullpenError::ConfigError("BULLPEN_CONCURRENCY must be at least 1".to_string()));
        }
        if config.lease_ms == 0 {
            return Err(BullpenError::ConfigError("BULLPEN_LEASE_MS must be positive".to_string()));
        }
        Ok(config)
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        if self.paths.is_empty() {
            DiscoveryOptions::Directory {
                path: self.path.clone(),
                prefix: self.prefix.clone(),
            }
        } else {
            DiscoveryOptions::Globs(self.paths.clone())
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_ms),
            lease_duration: Duration::from_millis(self.lease_ms),
            ..WorkerConfig::default()
        }
    }
}

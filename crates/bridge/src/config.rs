use std::time::Duration;

use thiserror::Error;

use crate::batch::BatchConfig;
use crate::upload::DEFAULT_CHUNK_SIZE;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}={value} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub rpc_timeout: Duration,
    pub upload_timeout: Duration,
    pub callback_timeout: Duration,
    pub chunk_size: usize,
    pub batch: BatchConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch: BatchConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            rpc_timeout: millis(&lookup, "PDP_RPC_TIMEOUT_MS", defaults.rpc_timeout)?,
            upload_timeout: millis(&lookup, "PDP_UPLOAD_TIMEOUT_MS", defaults.upload_timeout)?,
            callback_timeout: millis(&lookup, "PDP_CALLBACK_TIMEOUT_MS", defaults.callback_timeout)?,
            chunk_size: positive(&lookup, "PDP_CHUNK_SIZE", defaults.chunk_size)?,
            batch: BatchConfig {
                interval: millis(&lookup, "PDP_BATCH_INTERVAL_MS", defaults.batch.interval)?,
                max_size: positive(&lookup, "PDP_BATCH_MAX_SIZE", defaults.batch.max_size)?,
            },
        })
    }
}

fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: usize,
) -> Result<usize, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let invalid = |reason: &str| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: reason.to_owned(),
    };
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(invalid("must be greater than zero")),
        Ok(value) => Ok(value),
        Err(err) => Err(invalid(&err.to_string())),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let fallback = default.as_millis() as usize;
    positive(lookup, key, fallback).map(|ms| Duration::from_millis(ms as u64))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_budgets() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
        assert_eq!(config.upload_timeout, Duration::from_secs(120));
        assert_eq!(config.batch.interval, Duration::from_millis(50));
        assert_eq!(config.batch.max_size, 10);
        assert_eq!(config.chunk_size, 256 * 1024);
    }

    #[test]
    fn overrides_are_applied() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("PDP_RPC_TIMEOUT_MS", "1500"),
            ("PDP_BATCH_MAX_SIZE", " 25 "),
            ("PDP_CHUNK_SIZE", "4096"),
        ]))
        .unwrap();
        assert_eq!(config.rpc_timeout, Duration::from_millis(1500));
        assert_eq!(config.batch.max_size, 25);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.callback_timeout, DEFAULT_CALLBACK_TIMEOUT);
    }

    #[test]
    fn zero_and_garbage_are_rejected() {
        let err = BridgeConfig::from_lookup(lookup(&[("PDP_BATCH_MAX_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PDP_BATCH_MAX_SIZE", .. }));
        let err = BridgeConfig::from_lookup(lookup(&[("PDP_RPC_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().starts_with("PDP_RPC_TIMEOUT_MS=soon is invalid"));
    }
}

//! Indexer Configuration
//!
//! Settings read from environment variables. Unset variables fall back to defaults;
//! set but malformed variables are errors.

use rust_decimal::Decimal;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::Level;

use crate::chain::{RetryConfig, RpcEndpoint};
use crate::cursor::ScanWindow;
use crate::fee::DEFAULT_FEE_RATE;
use crate::redis_store::DEFAULT_KEY_PREFIX;

pub const DEFAULT_RPC_URL: &str = "https://mainnet.base.org";
pub const DEFAULT_DATABASE_PATH: &str = "builderscan.json";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Storage backend selected by the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Redis { url: String, key_prefix: String },
    Snapshot { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerConfig {
    pub rpc: RpcEndpoint,
    pub storage: StorageConfig,
    pub window: ScanWindow,
    pub fee_rate: Decimal,
    pub retry: RetryConfig,
    /// Re-trigger interval; `None` runs a single invocation
    pub scan_interval: Option<Duration>,
    pub log_level: Level,
}

impl IndexerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        let rpc_url = get("BASE_RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.to_string());
        let rpc = RpcEndpoint::parse(&rpc_url).map_err(|e| ConfigError::Invalid {
            key: "BASE_RPC_URL",
            value: rpc_url.clone(),
            reason: e.to_string(),
        })?;

        let storage = match get("REDIS_URL") {
            Some(url) => StorageConfig::Redis {
                url,
                key_prefix: get("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            },
            None => StorageConfig::Snapshot {
                path: PathBuf::from(
                    get("DATABASE_PATH").unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
                ),
            },
        };

        let defaults = ScanWindow::default();
        let window = ScanWindow {
            blocks_per_day: parse_or(&get, "BLOCKS_PER_DAY", defaults.blocks_per_day)?,
            days_back: parse_or(&get, "SCAN_DAYS_BACK", defaults.days_back)?,
            start_block: parse_opt(&get, "START_BLOCK")?,
            max_blocks_per_run: parse_or(&get, "MAX_BLOCKS_PER_RUN", defaults.max_blocks_per_run)?,
        };
        if window.max_blocks_per_run == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_BLOCKS_PER_RUN",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let fee_rate: Decimal = parse_or(&get, "FEE_RATE", DEFAULT_FEE_RATE)?;
        if fee_rate.is_sign_negative() {
            return Err(ConfigError::Invalid {
                key: "FEE_RATE",
                value: fee_rate.to_string(),
                reason: "must not be negative".to_string(),
            });
        }

        let retry_defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_retries: parse_or(&get, "RPC_MAX_RETRIES", retry_defaults.max_retries)?,
            initial_backoff_ms: parse_or(
                &get,
                "RPC_INITIAL_BACKOFF_MS",
                retry_defaults.initial_backoff_ms,
            )?,
            max_backoff_ms: parse_or(&get, "RPC_MAX_BACKOFF_MS", retry_defaults.max_backoff_ms)?,
        };

        let scan_interval = parse_opt::<u64, _>(&get, "SCAN_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            rpc,
            storage,
            window,
            fee_rate,
            retry,
            scan_interval,
            log_level: parse_or(&get, "LOG_LEVEL", Level::INFO)?,
        })
    }
}

fn parse_opt<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(get, key)?.unwrap_or(default))
}

//! Runtime configuration from environment variables

use crate::signature::parse_public_key;
use crate::sqlite_pragma::Durability;
use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct ClickhouseConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// Configuration for the sink runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Path to the SQLite journal file
    pub journal_path: String,

    pub durability: Durability,

    /// Commit cycle interval in milliseconds
    pub commit_interval_ms: u64,

    /// Upper bound for one sink insert in milliseconds
    pub sink_timeout_ms: u64,

    /// Trusted webhook signers, key id -> key
    pub public_keys: HashMap<String, VerifyingKey>,

    pub clickhouse: ClickhouseConfig,
}

impl SinkConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CHAINSINK_JOURNAL_PATH` (default: data/journal.db)
    /// - `CHAINSINK_JOURNAL_DURABILITY` (default: full; normal, off)
    /// - `CHAINSINK_COMMIT_INTERVAL_MS` (default: 5000)
    /// - `CHAINSINK_SINK_TIMEOUT_MS` (default: 30000)
    /// - `CHAINSINK_PUBLIC_KEYS` (comma-separated hex ed25519 keys, default: none)
    /// - `CLICKHOUSE_URL` (default: http://localhost:8123)
    /// - `CLICKHOUSE_DATABASE` (default: default)
    /// - `CLICKHOUSE_USER` (default: default)
    /// - `CLICKHOUSE_PASSWORD` (default: empty)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let public_keys = match lookup("CHAINSINK_PUBLIC_KEYS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(|k| {
                    parse_public_key(k).map_err(|e| ConfigError::InvalidValue {
                        name: "CHAINSINK_PUBLIC_KEYS".to_string(),
                        reason: e.to_string(),
                    })
                })
                .collect::<Result<HashMap<_, _>, _>>()?,
            None => HashMap::new(),
        };

        if public_keys.is_empty() {
            log::warn!("⚠️  CHAINSINK_PUBLIC_KEYS is empty, every webhook will be rejected");
        }

        let commit_interval_ms: u64 = parse_var(&lookup, "CHAINSINK_COMMIT_INTERVAL_MS", 5_000)?;
        if commit_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "CHAINSINK_COMMIT_INTERVAL_MS".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            journal_path: text("CHAINSINK_JOURNAL_PATH", "data/journal.db"),
            durability: parse_var(&lookup, "CHAINSINK_JOURNAL_DURABILITY", Durability::Full)?,
            commit_interval_ms,
            sink_timeout_ms: parse_var(&lookup, "CHAINSINK_SINK_TIMEOUT_MS", 30_000)?,
            public_keys,
            clickhouse: ClickhouseConfig {
                url: text("CLICKHOUSE_URL", "http://localhost:8123"),
                database: text("CLICKHOUSE_DATABASE", "default"),
                user: text("CLICKHOUSE_USER", "default"),
                password: text("CLICKHOUSE_PASSWORD", ""),
            },
        })
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name: name.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

//! Configuration management for herald
//!
//! This module handles loading and validating configuration from environment variables
//! and TOML files. Command-line flags override individual values in `main`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::retry::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Dispatch engine configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dispatch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of deliveries in flight for one broadcast
    pub max_concurrent_deliveries: usize,

    /// Retries after the first failed write to one recipient
    pub retry_bound: u32,

    /// Base delay between write retries in milliseconds
    pub retry_base_delay_ms: u64,

    /// Upper bound for the retry delay in milliseconds
    pub retry_max_delay_ms: u64,

    /// Deadline applied to a send when the caller supplies none
    pub default_timeout_secs: u64,

    /// Drop the owner from an explicit target list
    pub exclude_owner_from_explicit: bool,

    /// Age after which a `sending` broadcast is considered abandoned
    pub lease_ttl_secs: u64,
}

/// Storage backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Postgres,
}

impl StorageBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" => Some(Self::Sqlite),
            "postgres" | "postgresql" => Some(Self::Postgres),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Which backend to open
    pub backend: StorageBackend,

    /// SQLite database path
    pub sqlite_path: PathBuf,

    /// PostgreSQL connection string
    pub postgres_url: String,

    /// Maximum pool size
    pub pool_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: 16,
            retry_bound: 1,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 1000,
            default_timeout_secs: 60,
            exclude_owner_from_explicit: false,
            lease_ttl_secs: 900,
        }
    }
}

impl DispatchConfig {
    /// Set the fan-out ceiling
    pub fn with_max_concurrent_deliveries(mut self, limit: usize) -> Self {
        self.max_concurrent_deliveries = limit;
        self
    }

    /// Set the retry bound and base delay
    pub fn with_retries(mut self, retry_bound: u32, base_delay_ms: u64) -> Self {
        self.retry_bound = retry_bound;
        self.retry_base_delay_ms = base_delay_ms;
        self
    }

    /// Set the default deadline
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Drop the owner from explicit target lists
    pub fn with_owner_excluded(mut self, exclude: bool) -> Self {
        self.exclude_owner_from_explicit = exclude;
        self
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Retry policy for a single recipient
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_delays(
            self.retry_bound,
            self.retry_base_delay_ms,
            self.retry_max_delay_ms,
        )
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: PathBuf::from("data/herald.db"),
            postgres_url: String::from("postgresql://localhost/herald"),
            pool_size: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = DispatchConfig::default();

        let dispatch = DispatchConfig {
            max_concurrent_deliveries: env_parse("HERALD_MAX_CONCURRENT_DELIVERIES")
                .unwrap_or(defaults.max_concurrent_deliveries),
            retry_bound: env_parse("HERALD_RETRY_BOUND").unwrap_or(defaults.retry_bound),
            retry_base_delay_ms: env_parse("HERALD_RETRY_BASE_DELAY_MS")
                .unwrap_or(defaults.retry_base_delay_ms),
            retry_max_delay_ms: env_parse("HERALD_RETRY_MAX_DELAY_MS")
                .unwrap_or(defaults.retry_max_delay_ms),
            default_timeout_secs: env_parse("HERALD_SEND_TIMEOUT")
                .unwrap_or(defaults.default_timeout_secs),
            exclude_owner_from_explicit: env_parse("HERALD_EXCLUDE_OWNER")
                .unwrap_or(defaults.exclude_owner_from_explicit),
            lease_ttl_secs: env_parse("HERALD_LEASE_TTL").unwrap_or(defaults.lease_ttl_secs),
        };

        let backend = match std::env::var("HERALD_STORAGE_BACKEND") {
            Ok(value) => StorageBackend::parse(&value)
                .with_context(|| format!("Unknown storage backend: {value}"))?,
            Err(_) => StorageBackend::Sqlite,
        };

        let sqlite_path = std::env::var("HERALD_SQLITE_PATH")
            .unwrap_or_else(|_| String::from("data/herald.db"))
            .into();

        let postgres_url = std::env::var("POSTGRES_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or_else(|_| String::from("postgresql://localhost/herald"));

        let pool_size = env_parse("HERALD_DB_POOL_SIZE").unwrap_or(10);

        let log_level = std::env::var("HERALD_LOG_LEVEL").unwrap_or_else(|_| String::from("info"));

        let log_format =
            std::env::var("HERALD_LOG_FORMAT").unwrap_or_else(|_| String::from("text"));

        Ok(Self {
            dispatch,
            database: DatabaseConfig {
                backend,
                sqlite_path,
                postgres_url,
                pool_size,
            },
            logging: LoggingConfig {
                level: log_level,
                format: log_format,
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_concurrent_deliveries == 0 {
            anyhow::bail!("max_concurrent_deliveries must be greater than 0");
        }

        if self.dispatch.default_timeout_secs == 0 {
            anyhow::bail!("default_timeout_secs must be greater than 0");
        }

        if self.dispatch.retry_max_delay_ms < self.dispatch.retry_base_delay_ms {
            anyhow::bail!("retry_max_delay_ms must not be smaller than retry_base_delay_ms");
        }

        if self.database.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("log format must be 'text' or 'json'");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.max_concurrent_deliveries, 16);
        assert_eq!(config.dispatch.retry_bound, 1);
    }

    #[test]
    fn test_invalid_concurrency() {
        let mut config = Config::default();
        config.dispatch.max_concurrent_deliveries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = String::from("xml");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_conversion() {
        let config = Config::default();
        assert_eq!(config.dispatch.default_timeout(), Duration::from_secs(60));
        assert_eq!(config.dispatch.lease_ttl(), Duration::from_secs(900));
    }

    #[test]
    fn test_retry_config_follows_bound() {
        let dispatch = DispatchConfig::default().with_retries(2, 10);
        let retry = dispatch.retry_config();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.base_delay_ms, 10);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [dispatch]
            max_concurrent_deliveries = 4

            [database]
            backend = "postgres"
            "#,
        )
        .unwrap();

        assert_eq!(config.dispatch.max_concurrent_deliveries, 4);
        assert_eq!(config.dispatch.retry_bound, 1);
        assert_eq!(config.database.backend, StorageBackend::Postgres);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(StorageBackend::parse("SQLite"), Some(StorageBackend::Sqlite));
        assert_eq!(StorageBackend::parse("postgresql"), Some(StorageBackend::Postgres));
        assert_eq!(StorageBackend::parse("mysql"), None);
    }
}

//! Tests for config loading

use std::io::Write;
use std::time::Duration;

use herald::config::{Config, StorageBackend};
use serial_test::serial;
use tempfile::NamedTempFile;

const HERALD_VARS: &[&str] = &[
    "HERALD_MAX_CONCURRENT_DELIVERIES",
    "HERALD_RETRY_BOUND",
    "HERALD_RETRY_BASE_DELAY_MS",
    "HERALD_RETRY_MAX_DELAY_MS",
    "HERALD_SEND_TIMEOUT",
    "HERALD_EXCLUDE_OWNER",
    "HERALD_LEASE_TTL",
    "HERALD_STORAGE_BACKEND",
    "HERALD_SQLITE_PATH",
    "HERALD_DB_POOL_SIZE",
    "HERALD_LOG_LEVEL",
    "HERALD_LOG_FORMAT",
];

fn clear_env() {
    for key in HERALD_VARS {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_from_env_defaults() {
    clear_env();

    let config = Config::from_env().unwrap();
    assert_eq!(config.dispatch.max_concurrent_deliveries, 16);
    assert_eq!(config.dispatch.retry_bound, 1);
    assert_eq!(config.dispatch.default_timeout(), Duration::from_secs(60));
    assert!(!config.dispatch.exclude_owner_from_explicit);
    assert_eq!(config.database.backend, StorageBackend::Sqlite);
    assert_eq!(config.logging.level, "info");
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_from_env_overrides() {
    clear_env();
    std::env::set_var("HERALD_MAX_CONCURRENT_DELIVERIES", "4");
    std::env::set_var("HERALD_RETRY_BOUND", "3");
    std::env::set_var("HERALD_EXCLUDE_OWNER", "true");
    std::env::set_var("HERALD_STORAGE_BACKEND", "postgresql");
    std::env::set_var("HERALD_LOG_FORMAT", "json");

    let config = Config::from_env().unwrap();
    clear_env();

    assert_eq!(config.dispatch.max_concurrent_deliveries, 4);
    assert_eq!(config.dispatch.retry_bound, 3);
    assert_eq!(config.dispatch.retry_config().max_attempts(), 4);
    assert!(config.dispatch.exclude_owner_from_explicit);
    assert_eq!(config.database.backend, StorageBackend::Postgres);
    assert_eq!(config.logging.format, "json");
}

#[test]
#[serial]
fn test_from_env_ignores_unparsable_numbers() {
    clear_env();
    std::env::set_var("HERALD_RETRY_BOUND", "many");

    let config = Config::from_env().unwrap();
    clear_env();

    assert_eq!(config.dispatch.retry_bound, 1);
}

#[test]
#[serial]
fn test_from_env_rejects_unknown_backend() {
    clear_env();
    std::env::set_var("HERALD_STORAGE_BACKEND", "mongodb");

    let result = Config::from_env();
    clear_env();

    assert!(result.is_err());
}

#[test]
fn test_from_file_partial_sections() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[dispatch]
max_concurrent_deliveries = 8
exclude_owner_from_explicit = true

[database]
backend = "sqlite"
sqlite_path = "/tmp/herald-test.db"
"#
    )
    .unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.dispatch.max_concurrent_deliveries, 8);
    assert!(config.dispatch.exclude_owner_from_explicit);
    // Unset keys fall back to defaults
    assert_eq!(config.dispatch.retry_bound, 1);
    assert_eq!(config.database.pool_size, 10);
    assert_eq!(config.logging.format, "text");
    assert!(config.validate().is_ok());
}

#[test]
fn test_from_file_invalid_toml() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[dispatch\nmax_concurrent_deliveries = ").unwrap();

    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn test_from_file_missing() {
    let result = Config::from_file(std::path::Path::new("/nonexistent/herald.toml"));
    assert!(result.is_err());
}

#[test]
fn test_sample_config_parses() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config.toml");
    let config = Config::from_file(&path).unwrap();
    assert!(config.validate().is_ok());
}

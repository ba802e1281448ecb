use api_mutator::config::*;
use api_mutator::error::MutatorError;
use clap::Parser;
use std::time::Duration;

#[test]
fn test_default_intervals() {
    assert_eq!(DEFAULT_LEASE_DURATION_SECS, 60);
    assert_eq!(DEFAULT_LEASE_REFRESH_SECS, 20);
    assert_eq!(DEFAULT_CANCELLATION_POLL_SECS, 5);
    assert_eq!(DEFAULT_MAX_RUN_ATTEMPTS, 3);
    assert_eq!(DEFAULT_CONSUMER_COUNT, 10);
}

#[test]
fn test_default_config_is_valid() {
    let config = MutatorConfig::default();
    assert!(config.validate().is_ok());
    assert!(config.worker_count >= 1 && config.worker_count <= MAX_DEFAULT_WORKERS);
    assert_eq!(config.queue_retention, chrono::Duration::days(7));
    assert_eq!(config.retry.max_attempts, 3);
}

#[test]
fn test_refresh_must_be_shorter_than_lease() {
    let config = MutatorConfig {
        lease_duration: Duration::from_secs(20),
        lease_refresh_interval: Duration::from_secs(20),
        ..Default::default()
    };
    assert!(matches!(config.validate(), Err(MutatorError::Config(_))));
}

#[test]
fn test_flush_must_not_exceed_consumer_timeout() {
    let config = MutatorConfig {
        write_flush_interval: Duration::from_secs(11),
        consumer_block_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    assert!(matches!(config.validate(), Err(MutatorError::Config(_))));
}

#[test]
fn test_zero_sizes_are_rejected() {
    let config = MutatorConfig {
        consumer_count: 0,
        ..Default::default()
    };
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("consumer count"));

    let config = MutatorConfig {
        read_batch_size: 0,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_cli_overrides() {
    let args = CliArgs::parse_from([
        "api-mutator",
        "--database",
        "/tmp/mutator-test.db",
        "--workers",
        "2",
        "--consumers",
        "4",
        "--polling",
        "--dry-run",
        "--lease-secs",
        "30",
        "--lease-refresh-secs",
        "10",
    ]);
    let config = MutatorConfig::from_args(args);
    assert_eq!(config.database_path.to_str(), Some("/tmp/mutator-test.db"));
    assert_eq!(config.worker_count, 2);
    assert_eq!(config.consumer_count, 4);
    assert!(config.polling);
    assert!(config.dry_run);
    assert_eq!(config.lease_duration, Duration::from_secs(30));
    assert_eq!(config.lease_refresh_interval, Duration::from_secs(10));
    assert!(config.validate().is_ok());
}

#[test]
fn test_cli_defaults() {
    let config = MutatorConfig::from_args(CliArgs::parse_from(["api-mutator"]));
    assert_eq!(config.port, DEFAULT_PORT);
    assert!(!config.polling);
    assert!(config.log_dir.is_none());
    assert_eq!(
        config.write_flush_interval,
        Duration::from_millis(DEFAULT_WRITE_FLUSH_INTERVAL_MS)
    );
}

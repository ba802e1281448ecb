use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::MutatorError;

/// api-mutator: generates mutated API requests, runs them and validates the responses.
#[derive(Parser, Debug, Clone)]
#[command(name = "api-mutator")]
pub struct CliArgs {
    /// SQLite database file
    #[arg(long = "database")]
    pub database: Option<PathBuf>,

    /// Intake HTTP port
    #[arg(long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Test value manifest (JSON map of test type to value file)
    #[arg(long = "values", default_value = "values/manifest.json")]
    pub values: PathBuf,

    /// Default validator configuration (JSON)
    #[arg(long = "validator-config", default_value = "config/validators.json")]
    pub validator_config: PathBuf,

    /// Number of worker loops (defaults to CPU count, capped)
    #[arg(short = 'w', long = "workers")]
    pub workers: Option<usize>,

    /// Consumers per test run
    #[arg(short = 'c', long = "consumers", default_value_t = DEFAULT_CONSUMER_COUNT)]
    pub consumers: usize,

    /// Poll storage for runs instead of waiting on intake notifications
    #[arg(long = "polling")]
    pub polling: bool,

    /// Generate tests only, never execute them
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Directory for daily rolling log files
    #[arg(long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    #[arg(long = "lease-secs", default_value_t = DEFAULT_LEASE_DURATION_SECS)]
    pub lease_secs: u64,

    #[arg(long = "lease-refresh-secs", default_value_t = DEFAULT_LEASE_REFRESH_SECS)]
    pub lease_refresh_secs: u64,

    #[arg(long = "cancel-poll-secs", default_value_t = DEFAULT_CANCELLATION_POLL_SECS)]
    pub cancel_poll_secs: u64,

    #[arg(long = "consumer-timeout-secs", default_value_t = DEFAULT_CONSUMER_BLOCK_TIMEOUT_SECS)]
    pub consumer_timeout_secs: u64,

    #[arg(long = "flush-interval-ms", default_value_t = DEFAULT_WRITE_FLUSH_INTERVAL_MS)]
    pub flush_interval_ms: u64,

    #[arg(long = "max-run-attempts", default_value_t = DEFAULT_MAX_RUN_ATTEMPTS)]
    pub max_run_attempts: i64,

    #[arg(long = "request-timeout-secs", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,
}

// Intake
pub const DEFAULT_PORT: u16 = 8000;
pub const DATABASE_FILE_NAME: &str = "mutator.db";

// Worker loop
pub const MAX_DEFAULT_WORKERS: usize = 6;
pub const DEFAULT_WORKER_LOOP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAX_RUN_ATTEMPTS: i64 = 3;
pub const POLLING_JITTER_MIN_SECS: f64 = 0.1;
pub const POLLING_JITTER_MAX_SECS: f64 = 5.0;

// Lease
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 60;
pub const DEFAULT_LEASE_REFRESH_SECS: u64 = 20;
pub const DEFAULT_CANCELLATION_POLL_SECS: u64 = 5;

// Consumers
pub const DEFAULT_CONSUMER_COUNT: usize = 10;
pub const DEFAULT_CONSUMER_BLOCK_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

// Queues
pub const DEFAULT_EXECUTION_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_WRITE_BUFFER_CAPACITY: usize = 500;
pub const DEFAULT_WRITE_FLUSH_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_READ_BATCH_SIZE: usize = 100;
pub const DEFAULT_HANDOFF_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_HANDOFF_MAX_RETRIES: u32 = 10;
pub const DEFAULT_HANDOFF_RETRY_SLEEP_SECS: u64 = 2;
pub const QUEUE_RETENTION_DAYS: i64 = 7;

// Request retry
pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_MAX_TOTAL_WAIT_SECS: u64 = 60;
pub const RETRY_MAX_BACKOFF_SECS: u64 = 60;
pub const RETRY_MULTIPLIER_SECS: f64 = 1.0;

// Run bookkeeping writes race the lease refresher on `version`.
pub const RUN_UPDATE_MAX_RETRIES: u32 = 5;

/// Backoff policy for a single test's HTTP request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_total_wait: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            max_total_wait: Duration::from_secs(RETRY_MAX_TOTAL_WAIT_SECS),
            max_backoff: Duration::from_secs(RETRY_MAX_BACKOFF_SECS),
            multiplier: RETRY_MULTIPLIER_SECS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutatorConfig {
    pub database_path: PathBuf,
    pub port: u16,
    pub values_manifest: PathBuf,
    pub validator_config: PathBuf,
    pub worker_count: usize,
    pub polling: bool,
    pub dry_run: bool,
    pub log_dir: Option<PathBuf>,

    pub worker_loop_interval: Duration,
    pub max_run_attempts: i64,

    pub lease_duration: Duration,
    pub lease_refresh_interval: Duration,
    pub cancellation_poll_interval: Duration,

    pub consumer_count: usize,
    pub consumer_block_timeout: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,

    pub execution_queue_capacity: usize,
    pub write_buffer_capacity: usize,
    pub write_flush_interval: Duration,
    pub read_batch_size: usize,
    pub handoff_timeout: Duration,
    pub handoff_max_retries: u32,
    pub handoff_retry_sleep: Duration,
    pub queue_retention: chrono::Duration,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            port: DEFAULT_PORT,
            values_manifest: PathBuf::from("values/manifest.json"),
            validator_config: PathBuf::from("config/validators.json"),
            worker_count: default_worker_count(),
            polling: false,
            dry_run: false,
            log_dir: None,
            worker_loop_interval: Duration::from_secs(DEFAULT_WORKER_LOOP_INTERVAL_SECS),
            max_run_attempts: DEFAULT_MAX_RUN_ATTEMPTS,
            lease_duration: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS),
            lease_refresh_interval: Duration::from_secs(DEFAULT_LEASE_REFRESH_SECS),
            cancellation_poll_interval: Duration::from_secs(DEFAULT_CANCELLATION_POLL_SECS),
            consumer_count: DEFAULT_CONSUMER_COUNT,
            consumer_block_timeout: Duration::from_secs(DEFAULT_CONSUMER_BLOCK_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            execution_queue_capacity: DEFAULT_EXECUTION_QUEUE_CAPACITY,
            write_buffer_capacity: DEFAULT_WRITE_BUFFER_CAPACITY,
            write_flush_interval: Duration::from_millis(DEFAULT_WRITE_FLUSH_INTERVAL_MS),
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            handoff_timeout: Duration::from_secs(DEFAULT_HANDOFF_TIMEOUT_SECS),
            handoff_max_retries: DEFAULT_HANDOFF_MAX_RETRIES,
            handoff_retry_sleep: Duration::from_secs(DEFAULT_HANDOFF_RETRY_SLEEP_SECS),
            queue_retention: chrono::Duration::days(QUEUE_RETENTION_DAYS),
        }
    }
}

impl MutatorConfig {
    pub fn from_args(args: CliArgs) -> Self {
        let defaults = Self::default();
        Self {
            database_path: args.database.unwrap_or(defaults.database_path),
            port: args.port,
            values_manifest: args.values,
            validator_config: args.validator_config,
            worker_count: args.workers.unwrap_or(defaults.worker_count),
            polling: args.polling,
            dry_run: args.dry_run,
            log_dir: args.log_dir,
            max_run_attempts: args.max_run_attempts,
            lease_duration: Duration::from_secs(args.lease_secs),
            lease_refresh_interval: Duration::from_secs(args.lease_refresh_secs),
            cancellation_poll_interval: Duration::from_secs(args.cancel_poll_secs),
            consumer_count: args.consumers,
            consumer_block_timeout: Duration::from_secs(args.consumer_timeout_secs),
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            write_flush_interval: Duration::from_millis(args.flush_interval_ms),
            ..defaults
        }
    }

    /// Interval relationships that must hold before any worker starts.
    pub fn validate(&self) -> Result<(), MutatorError> {
        if self.lease_refresh_interval >= self.lease_duration {
            return Err(MutatorError::Config(format!(
                "lease refresh interval ({:?}) must be shorter than the lease duration ({:?}), \
                 otherwise the lease runs out before it is refreshed",
                self.lease_refresh_interval, self.lease_duration
            )));
        }
        // A flush slower than the consumer timeout lets every consumer give up
        // while the execution queue is still being filled.
        if self.write_flush_interval > self.consumer_block_timeout {
            return Err(MutatorError::Config(format!(
                "write flush interval ({:?}) must not exceed the consumer blocking timeout ({:?})",
                self.write_flush_interval, self.consumer_block_timeout
            )));
        }
        let sizes = [
            ("worker count", self.worker_count),
            ("consumer count", self.consumer_count),
            ("execution queue capacity", self.execution_queue_capacity),
            ("write buffer capacity", self.write_buffer_capacity),
            ("read batch size", self.read_batch_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(MutatorError::Config(format!("{} must be at least 1", name)));
            }
        }
        if self.max_run_attempts < 1 {
            return Err(MutatorError::Config(
                "max run attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("api-mutator"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATABASE_FILE_NAME)
}

/// One worker per CPU, capped at [`MAX_DEFAULT_WORKERS`].
pub fn default_worker_count() -> usize {
    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::new().with_cpu(sysinfo::CpuRefreshKind::new()),
    );
    sys.cpus().len().clamp(1, MAX_DEFAULT_WORKERS)
}

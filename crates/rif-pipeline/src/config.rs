//! Pipeline configuration, loaded from the environment.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::{PipelineError, PipelineResult};
use crate::job::DATA_AVAILABILITY_POLL_INTERVAL;
use crate::s3::StorageConfig;
use crate::store::DataSetFilter;

// ============================================================================
// Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/rif";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 20;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default local cache budget: 100 GiB, comfortably above the prefetch
/// gate so the next data set can stage while one loads.
pub const DEFAULT_CACHE_BUDGET_BYTES: u64 = 100 * 1024 * 1024 * 1024;

/// Default window size for the record loader.
pub const DEFAULT_LOADER_WINDOW_SIZE: usize = 100;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            connect_timeout_secs: std::env::var("DATABASE_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
        }
    }

    pub async fn create_pool(&self) -> PipelineResult<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(self.connect_timeout_secs))
            .connect(&self.url)
            .await?;
        Ok(pool)
    }
}

/// Everything the pipeline binary needs to run.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DbConfig,
    pub storage: StorageConfig,
    /// Directory for locally cached data files.
    pub cache_dir: std::path::PathBuf,
    pub cache_budget_bytes: u64,
    /// Interval between job invocations; absent means run exactly once.
    pub run_interval: Option<Duration>,
    pub data_availability_poll_interval: Duration,
    pub data_set_filter: DataSetFilter,
    /// Worker tasks for record persistence. Defaults to four per CPU.
    pub loader_threads: usize,
    pub loader_window_size: usize,
    /// Include raw record contents in load-error messages. Off by
    /// default: RIF records carry PHI.
    pub expose_record_contents: bool,
    /// Move completed data sets to the done prefix in the bucket.
    pub move_completed_files: bool,
}

impl AppConfig {
    /// Load configuration from environment and defaults.
    pub fn from_env() -> PipelineResult<Self> {
        let default_threads = std::thread::available_parallelism()
            .map(|n| n.get() * 4)
            .unwrap_or(16);

        Ok(Self {
            database: DbConfig::from_env(),
            storage: StorageConfig::from_env()?,
            cache_dir: std::env::var("RIF_CACHE_DIR")
                .unwrap_or_else(|_| "rif-cache".to_string())
                .into(),
            cache_budget_bytes: std::env::var("RIF_CACHE_BUDGET_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CACHE_BUDGET_BYTES),
            run_interval: std::env::var("RIF_RUN_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs),
            data_availability_poll_interval: std::env::var("RIF_POLL_INTERVAL_MILLIS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(DATA_AVAILABILITY_POLL_INTERVAL),
            data_set_filter: match std::env::var("RIF_DATA_SET_FILTER") {
                Ok(value) => value.parse()?,
                Err(_) => DataSetFilter::All,
            },
            loader_threads: std::env::var("RIF_LOADER_THREADS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(default_threads),
            loader_window_size: std::env::var("RIF_LOADER_WINDOW_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(DEFAULT_LOADER_WINDOW_SIZE),
            expose_record_contents: env_flag("RIF_EXPOSE_RECORD_CONTENTS")?,
            move_completed_files: env_flag("RIF_MOVE_COMPLETED_FILES")?,
        })
    }
}

fn env_flag(name: &str) -> PipelineResult<bool> {
    match std::env::var(name) {
        Err(_) => Ok(false),
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            other => Err(PipelineError::Config(format!(
                "{name} must be a boolean, got '{other}'"
            ))),
        },
    }
}

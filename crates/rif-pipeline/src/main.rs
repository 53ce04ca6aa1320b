//! RIF pipeline - main entry point.

use std::sync::Arc;

use anyhow::Context;
use rif_common::logging::{init_logging, LogConfig};
use tracing::{error, info};

use rif_pipeline::app::RifLoaderListener;
use rif_pipeline::config::AppConfig;
use rif_pipeline::job::{JobOutcome, LoadJob, LoadJobConfig};
use rif_pipeline::loader::{PgRecordWriter, RifLoader};
use rif_pipeline::prevalidate::PgPreValidator;
use rif_pipeline::queue::DataSetQueue;
use rif_pipeline::s3::{LocalCache, S3ObjectStore};
use rif_pipeline::schema::create_or_update_schema;
use rif_pipeline::status::LogStatusPublisher;
use rif_pipeline::store::PgManifestStore;

/// Exit code for configuration problems.
const EXIT_CODE_BAD_CONFIG: i32 = 2;
/// Exit code for schema migration failures.
const EXIT_CODE_FAILED_MIGRATION: i32 = 3;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let log_config = LogConfig::from_env().unwrap_or_default();
    if let Err(err) = init_logging(&log_config) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(EXIT_CODE_BAD_CONFIG);
    }

    info!("starting RIF pipeline");

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            std::process::exit(EXIT_CODE_BAD_CONFIG);
        }
    };

    let pool = match config.database.create_pool().await {
        Ok(pool) => pool,
        Err(err) => {
            error!(%err, url = config.database.url, "cannot connect to database");
            std::process::exit(EXIT_CODE_BAD_CONFIG);
        }
    };

    if let Err(err) = create_or_update_schema(&pool).await {
        error!(%err, "schema migration failed");
        std::process::exit(EXIT_CODE_FAILED_MIGRATION);
    }

    let job = match build_job(&config, pool).await {
        Ok(job) => job,
        Err(err) => {
            error!(%err, "cannot assemble pipeline");
            std::process::exit(EXIT_CODE_BAD_CONFIG);
        }
    };

    let result = match config.run_interval {
        None => run_once(&job).await,
        Some(interval) => run_on_interval(&job, interval).await,
    };
    job.close();
    if let Err(err) = result {
        error!(%err, "pipeline run failed");
        std::process::exit(1);
    }
}

async fn build_job(config: &AppConfig, pool: sqlx::PgPool) -> anyhow::Result<LoadJob> {
    let object_store = Arc::new(
        S3ObjectStore::new(config.storage.clone())
            .await
            .context("initializing S3 client")?,
    );
    let cache = Arc::new(
        LocalCache::new(&config.cache_dir, config.cache_budget_bytes)
            .context("opening local download cache")?,
    );
    let queue = Arc::new(DataSetQueue::new(
        object_store,
        Arc::new(PgManifestStore::new(pool.clone())),
        cache,
        config.data_set_filter,
    ));

    let loader = RifLoader::new(
        Arc::new(PgRecordWriter::new(pool.clone())),
        config.loader_threads,
        config.loader_window_size,
        config.expose_record_contents,
    );
    let listener = Arc::new(RifLoaderListener::new(loader, Arc::clone(&queue)));

    Ok(LoadJob::new(
        queue,
        listener,
        Arc::new(PgPreValidator::new(pool)),
        Arc::new(LogStatusPublisher),
        LoadJobConfig {
            poll_interval: config.data_availability_poll_interval,
            move_completed_files: config.move_completed_files,
        },
    ))
}

async fn run_once(job: &LoadJob) -> anyhow::Result<()> {
    match job.run().await.context("load job invocation failed")? {
        JobOutcome::WorkDone => info!("data set loaded"),
        JobOutcome::NothingToDo => info!("nothing to do"),
    }
    Ok(())
}

/// Invokes the job on a fixed interval until interrupted. Invocations
/// never overlap; a long load simply delays the next tick.
async fn run_on_interval(job: &LoadJob, interval: std::time::Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                job.run().await.context("load job invocation failed")?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
        }
    }
}

//! The schedulable load job.
//!
//! One invocation processes at most one data set, start to finish. The
//! scheduler (run-once or fixed-interval) must serialize invocations;
//! within an invocation the listener hand-off is synchronous, which is
//! what guarantees no two data sets are ever mid-load at once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::prevalidate::PreValidator;
use crate::queue::DataSetQueue;
use crate::rif::{RifFilesEvent, S3RifFile};
use crate::s3::{S3_PREFIX_FAILED_DATA_SETS, S3_PREFIX_FAILED_SYNTHETIC_DATA_SETS};
use crate::status::{JobStage, StatusPublisher, StatusReporter};
use crate::store::ManifestRecord;

/// Prefetching the next data set only happens with this much cache
/// room free, so the current load always has space to finish.
pub const MIN_FREE_SPACE_FOR_PREFETCH_BYTES: u64 = 50 * 1024 * 1024 * 1024;

/// Poll interval while waiting for a manifest's data files to arrive.
pub const DATA_AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    NothingToDo,
    WorkDone,
}

/// Consumer of ready data sets. `data_available` must not return until
/// every record is durably persisted or has failed with a reported
/// error.
#[async_trait]
pub trait DataSetListener: Send + Sync {
    async fn data_available(&self, batch: RifFilesEvent) -> PipelineResult<()>;

    async fn no_data_available(&self) {}

    async fn error_occurred(&self, _error: &PipelineError) {}
}

pub struct LoadJobConfig {
    pub poll_interval: Duration,
    /// When set, completed data sets are also moved to the done prefix
    /// in the bucket. Rejected sets move to the failed prefix regardless.
    pub move_completed_files: bool,
}

impl Default for LoadJobConfig {
    fn default() -> Self {
        Self {
            poll_interval: DATA_AVAILABILITY_POLL_INTERVAL,
            move_completed_files: false,
        }
    }
}

pub struct LoadJob {
    queue: Arc<DataSetQueue>,
    listener: Arc<dyn DataSetListener>,
    pre_validator: Arc<dyn PreValidator>,
    reporter: StatusReporter,
    config: LoadJobConfig,
}

impl LoadJob {
    pub fn new(
        queue: Arc<DataSetQueue>,
        listener: Arc<dyn DataSetListener>,
        pre_validator: Arc<dyn PreValidator>,
        status_publisher: Arc<dyn StatusPublisher>,
        config: LoadJobConfig,
    ) -> Self {
        Self {
            queue,
            listener,
            pre_validator,
            reporter: StatusReporter::new(status_publisher),
            config,
        }
    }

    /// Runs one job invocation. Listener failures propagate out with the
    /// manifest left un-advanced, so the next invocation reconsiders it.
    pub async fn run(&self) -> PipelineResult<JobOutcome> {
        self.reporter.report(JobStage::CheckingBucketForManifest, None);

        let eligible = self.queue.read_eligible_manifests(chrono::Utc::now()).await?;
        let Some(record) = eligible.first() else {
            self.listener.no_data_available().await;
            self.reporter.report(JobStage::Idle, None);
            return Ok(JobOutcome::NothingToDo);
        };
        let manifest_key = record.manifest.incoming_s3_key();

        self.reporter
            .report(JobStage::AwaitingManifestDataFiles, Some(&manifest_key));
        self.wait_for_data(record).await?;

        // Pre-validation applies only to manifests that declare id
        // ranges, i.e. synthetic ones. It re-runs on every attempt, so
        // a retried data set must validate the same way it did first.
        if let Some(props) = record.manifest.pre_validation() {
            if !self.pre_validator.is_valid(&manifest_key, props).await? {
                return self.reject(record).await;
            }
        }

        self.queue.mark_as_started(record).await?;
        let batch = self.build_batch(record)?;
        self.prefetch_next(&eligible).await;

        self.reporter
            .report(JobStage::ProcessingManifestDataFiles, Some(&manifest_key));
        if let Err(err) = self.listener.data_available(batch.clone()).await {
            self.listener.error_occurred(&err).await;
            return Err(err);
        }

        self.queue.mark_as_processed(record).await?;
        self.cleanup_local_files(&batch);
        if self.config.move_completed_files {
            self.queue
                .move_manifest_files(&record.manifest, record.manifest.done_location())
                .await?;
        }
        self.reporter.report_completed(&manifest_key);
        Ok(JobOutcome::WorkDone)
    }

    /// Polls until every data file named by the manifest is present.
    ///
    /// Uploads are asynchronous, so absence is normal and only the first
    /// wait is logged. No timeout: a stalled upload stalls the job until
    /// an operator intervenes.
    async fn wait_for_data(&self, record: &ManifestRecord) -> PipelineResult<()> {
        let mut first_wait = true;
        while !self.queue.all_entries_exist_in_s3(&record.manifest).await? {
            if first_wait {
                info!(
                    manifest = %record.manifest.id(),
                    "data set not fully uploaded yet, waiting"
                );
                first_wait = false;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        Ok(())
    }

    async fn reject(&self, record: &ManifestRecord) -> PipelineResult<JobOutcome> {
        warn!(
            manifest = %record.manifest.id(),
            "pre-validation failed, rejecting data set"
        );
        self.queue.mark_as_rejected(record).await?;
        let failed_location = if record.manifest.is_synthetic_data() {
            S3_PREFIX_FAILED_SYNTHETIC_DATA_SETS
        } else {
            S3_PREFIX_FAILED_DATA_SETS
        };
        self.queue
            .move_manifest_files(&record.manifest, failed_location)
            .await?;
        self.reporter
            .report_completed(&record.manifest.incoming_s3_key());
        Ok(JobOutcome::WorkDone)
    }

    /// Wires each unfinished manifest entry to a shared download.
    /// Entries already completed or rejected by a previous attempt are
    /// left out, so a retried data set only repeats the remaining files.
    /// Downloads for the current data set are submitted here; the
    /// listener awaits them.
    fn build_batch(&self, record: &ManifestRecord) -> PipelineResult<RifFilesEvent> {
        let manifest = &record.manifest;
        let mut files = Vec::with_capacity(manifest.entries().len());
        for entry in manifest.entries() {
            let file = record.file_record(&entry.name).ok_or_else(|| {
                PipelineError::InvalidManifest {
                    s3_key: manifest.incoming_s3_key(),
                    message: format!("entry '{}' has no tracking row", entry.name),
                }
            })?;
            if !file.status.is_incomplete() {
                continue;
            }
            let download = self.queue.download_manifest_entry(manifest, &entry.name);
            // Drive the transfer even if the listener is slow to ask.
            tokio::spawn(download.clone());
            files.push(S3RifFile::new(
                entry.name.clone(),
                entry.file_type,
                file.record_id,
                manifest.entry_s3_key(&entry.name, manifest.incoming_location()),
                download,
            ));
        }
        Ok(RifFilesEvent::new(record.clone(), files))
    }

    /// Starts background downloads for the next eligible data set when
    /// enough cache space is free to hold it. Never blocks the current
    /// load.
    async fn prefetch_next(&self, eligible: &[ManifestRecord]) {
        let Some(next) = eligible.get(1) else { return };
        let free = self.queue.available_disk_space_in_bytes();
        if free < MIN_FREE_SPACE_FOR_PREFETCH_BYTES {
            info!(
                free_bytes = free,
                manifest = %next.manifest.id(),
                "skipping prefetch, not enough free space"
            );
            return;
        }
        let needed = match self.queue.data_set_size_in_bytes(&next.manifest).await {
            Ok(needed) => needed,
            Err(err) => {
                warn!(manifest = %next.manifest.id(), %err, "cannot size next data set, not prefetching");
                return;
            }
        };
        if needed > free {
            info!(
                free_bytes = free,
                needed_bytes = needed,
                manifest = %next.manifest.id(),
                "skipping prefetch, next data set does not fit"
            );
            return;
        }
        for entry in next.manifest.entries() {
            let download = self
                .queue
                .download_manifest_entry(&next.manifest, &entry.name);
            tokio::spawn(download);
        }
        info!(manifest = %next.manifest.id(), "prefetching next data set");
    }

    /// Deletes local copies whose downloads completed. Files still in
    /// flight keep their handles inside the queue until it forgets them.
    fn cleanup_local_files(&self, batch: &RifFilesEvent) {
        for file in batch.files() {
            if let Some(Ok(cached)) = file.download().now_or_never() {
                cached.delete();
            }
        }
    }

    /// Releases queue resources. In-flight downloads are abandoned.
    pub fn close(&self) {
        self.queue.close();
    }
}

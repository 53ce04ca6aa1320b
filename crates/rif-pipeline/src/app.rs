//! Wiring between the load job and the record loader.
//!
//! `RifLoaderListener` is the production [`DataSetListener`]: for each
//! file in a ready data set it awaits the download, streams the RIF
//! records through the loader, and records per-file completion so a
//! crash mid-data-set only repeats unfinished files.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::{PipelineError, PipelineResult};
use crate::job::DataSetListener;
use crate::loader::{RecordWriter, RifLoader};
use crate::queue::DataSetQueue;
use crate::rif::{RifFileReader, RifFilesEvent};

pub struct RifLoaderListener<W: RecordWriter> {
    loader: RifLoader<W>,
    queue: Arc<DataSetQueue>,
}

impl<W: RecordWriter> RifLoaderListener<W> {
    pub fn new(loader: RifLoader<W>, queue: Arc<DataSetQueue>) -> Self {
        Self { loader, queue }
    }
}

#[async_trait]
impl<W: RecordWriter> DataSetListener for RifLoaderListener<W> {
    /// Loads every file in the batch. Returns only once each record is
    /// durably persisted or has failed; any failed record fails the
    /// batch so the data set is reconsidered instead of half-advanced.
    async fn data_available(&self, batch: RifFilesEvent) -> PipelineResult<()> {
        let manifest_record_id = batch.manifest_record().record_id;
        for file in batch.files() {
            let cached = file.local_file().await?;
            let reader = RifFileReader::open(cached.path(), file.file_type())?;
            let loaded_file_id = self
                .loader
                .writer()
                .begin_file(manifest_record_id, file.file_type(), file.file_name())
                .await?;

            let summary = self
                .loader
                .process_file(
                    loaded_file_id,
                    reader,
                    &mut |_result| {},
                    &mut |err| error!(file = file.file_name(), %err, "record load failed"),
                )
                .await?;
            info!(
                file = file.file_name(),
                loaded = summary.loaded,
                failed = summary.failed,
                "RIF file load finished"
            );

            if summary.failed > 0 {
                return Err(PipelineError::RecordLoad {
                    file_type: file.file_type(),
                    detail: format!(
                        "{} of {} records failed in '{}'",
                        summary.failed,
                        summary.loaded + summary.failed,
                        file.file_name()
                    ),
                });
            }
            self.queue.mark_file_completed(file.file_record_id()).await?;
            // Evict before deleting: a retry of this data set must start a
            // fresh transfer rather than resolve to the dead cache entry.
            self.queue.evict_download(file.s3_key());
            cached.delete();
        }
        Ok(())
    }

    async fn no_data_available(&self) {
        info!("no data sets ready for loading");
    }

    async fn error_occurred(&self, error: &PipelineError) {
        error!(%error, "data set load failed");
    }
}

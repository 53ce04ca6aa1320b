//! Windowed, bounded-concurrency persistence of RIF records.
//!
//! Each record is persisted in its own transaction by a pool of worker
//! tasks; results are drained window by window in submission order and
//! delivered to caller-supplied handlers on the calling task. One bad
//! record never aborts its siblings.

mod batcher;
mod postgres;

use std::sync::Arc;

use rif_common::RifFileType;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::rif::RifRecordEvent;

pub use batcher::BatchCollector;
pub use postgres::PgRecordWriter;

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadAction {
    Loaded,
}

/// Per-record outcome delivered to the result handler.
#[derive(Debug, Clone)]
pub struct LoadResult {
    pub file_type: RifFileType,
    pub record_number: u64,
    pub action: LoadAction,
}

/// Counts accumulated across one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: u64,
    pub failed: u64,
}

/// Persistence seam for individual records. Each `write` call is one
/// transactional unit of work.
#[async_trait::async_trait]
pub trait RecordWriter: Send + Sync + 'static {
    /// Registers a file load, returning an id that `write` calls for the
    /// file's records refer back to.
    async fn begin_file(
        &self,
        manifest_record_id: i64,
        file_type: RifFileType,
        file_name: &str,
    ) -> PipelineResult<i64>;

    async fn write(&self, loaded_file_id: i64, record: &RifRecordEvent) -> PipelineResult<()>;
}

pub struct RifLoader<W: RecordWriter> {
    writer: Arc<W>,
    workers: Arc<Semaphore>,
    window_size: usize,
    expose_record_contents: bool,
}

impl<W: RecordWriter> RifLoader<W> {
    pub fn new(
        writer: Arc<W>,
        worker_count: usize,
        window_size: usize,
        expose_record_contents: bool,
    ) -> Self {
        Self {
            writer,
            workers: Arc::new(Semaphore::new(worker_count.max(1))),
            window_size: window_size.max(1),
            expose_record_contents,
        }
    }

    pub fn writer(&self) -> &Arc<W> {
        &self.writer
    }

    /// Persists every record from `records`, invoking exactly one handler
    /// per record, in submission order within each window.
    ///
    /// Records that fail to parse go straight to the error handler
    /// without a persistence task. Returns the aggregate counts; the
    /// caller judges overall batch success from them.
    pub async fn process_file(
        &self,
        loaded_file_id: i64,
        records: impl Iterator<Item = PipelineResult<RifRecordEvent>>,
        on_result: &mut (dyn FnMut(LoadResult) + Send),
        on_error: &mut (dyn FnMut(PipelineError) + Send),
    ) -> PipelineResult<LoadSummary> {
        let mut summary = LoadSummary::default();
        let mut windows = BatchCollector::new(self.window_size);

        for record in records {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    summary.failed += 1;
                    on_error(err);
                    continue;
                }
            };
            let task = self.submit(loaded_file_id, record);
            if let Some(window) = windows.push(task) {
                self.drain_window(window, &mut summary, on_result, on_error)
                    .await?;
            }
        }
        if let Some(window) = windows.finish() {
            self.drain_window(window, &mut summary, on_result, on_error)
                .await?;
        }

        debug!(
            loaded_file_id,
            loaded = summary.loaded,
            failed = summary.failed,
            "finished RIF file"
        );
        Ok(summary)
    }

    fn submit(
        &self,
        loaded_file_id: i64,
        record: RifRecordEvent,
    ) -> tokio::task::JoinHandle<Result<LoadResult, PipelineError>> {
        let writer = Arc::clone(&self.writer);
        let workers = Arc::clone(&self.workers);
        let expose = self.expose_record_contents;
        tokio::spawn(async move {
            // Closed semaphores do not occur here; acquire only fails
            // after close().
            let _permit = workers
                .acquire_owned()
                .await
                .map_err(|e| PipelineError::Task(e.to_string()))?;
            match writer.write(loaded_file_id, &record).await {
                Ok(()) => Ok(LoadResult {
                    file_type: record.file_type,
                    record_number: record.record_number,
                    action: LoadAction::Loaded,
                }),
                Err(err) => Err(PipelineError::RecordLoad {
                    file_type: record.file_type,
                    detail: if expose {
                        format!(
                            "record {} failed: {err} (contents: {})",
                            record.record_number,
                            record.to_json()
                        )
                    } else {
                        format!(
                            "record {} failed: {err} (contents redacted)",
                            record.record_number
                        )
                    },
                }),
            }
        })
    }

    /// Awaits one window's tasks in submission order, dispatching each
    /// outcome to the appropriate handler on this task.
    async fn drain_window(
        &self,
        window: Vec<tokio::task::JoinHandle<Result<LoadResult, PipelineError>>>,
        summary: &mut LoadSummary,
        on_result: &mut (dyn FnMut(LoadResult) + Send),
        on_error: &mut (dyn FnMut(PipelineError) + Send),
    ) -> PipelineResult<()> {
        for handle in window {
            match handle.await {
                Ok(Ok(result)) => {
                    summary.loaded += 1;
                    on_result(result);
                }
                Ok(Err(err)) => {
                    summary.failed += 1;
                    on_error(err);
                }
                // A panicked worker is unrecoverable for this invocation.
                Err(join_err) => return Err(PipelineError::Task(join_err.to_string())),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Writer that records what it saw and fails on demand.
    #[derive(Default)]
    struct FakeWriter {
        next_file_id: AtomicU64,
        written: Mutex<Vec<(i64, u64)>>,
        fail_record_numbers: Vec<u64>,
        in_flight: AtomicU64,
        max_in_flight: AtomicU64,
    }

    #[async_trait::async_trait]
    impl RecordWriter for FakeWriter {
        async fn begin_file(
            &self,
            _manifest_record_id: i64,
            _file_type: RifFileType,
            _file_name: &str,
        ) -> PipelineResult<i64> {
            Ok(self.next_file_id.fetch_add(1, Ordering::SeqCst) as i64)
        }

        async fn write(&self, loaded_file_id: i64, record: &RifRecordEvent) -> PipelineResult<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_record_numbers.contains(&record.record_number) {
                return Err(PipelineError::Task("simulated write failure".to_string()));
            }
            self.written
                .lock()
                .unwrap()
                .push((loaded_file_id, record.record_number));
            Ok(())
        }
    }

    fn records(count: u64) -> impl Iterator<Item = PipelineResult<RifRecordEvent>> {
        (1..=count).map(|n| {
            Ok(RifRecordEvent {
                file_type: RifFileType::Pde,
                record_number: n,
                fields: vec![("PDE_ID".to_string(), n.to_string())],
            })
        })
    }

    #[tokio::test]
    async fn every_record_gets_exactly_one_handler_call() {
        // 2 full windows plus a partial window of 7.
        let window_size = 10;
        let total = 2 * window_size + 7;
        let loader = RifLoader::new(Arc::new(FakeWriter::default()), 4, window_size as usize, false);

        let mut seen = Vec::new();
        let mut errors = 0u64;
        let summary = loader
            .process_file(
                1,
                records(total),
                &mut |result| seen.push(result.record_number),
                &mut |_| errors += 1,
            )
            .await
            .unwrap();

        assert_eq!(summary.loaded, total);
        assert_eq!(summary.failed, 0);
        assert_eq!(errors, 0);
        assert_eq!(seen.len(), total as usize);
        // Submission order within and across windows.
        assert_eq!(seen, (1..=total).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn one_bad_record_does_not_abort_its_siblings() {
        let writer = Arc::new(FakeWriter {
            fail_record_numbers: vec![3],
            ..FakeWriter::default()
        });
        let loader = RifLoader::new(Arc::clone(&writer), 2, 4, false);

        let mut ok = Vec::new();
        let mut errs = Vec::new();
        let summary = loader
            .process_file(
                1,
                records(5),
                &mut |result| ok.push(result.record_number),
                &mut |err| errs.push(err.to_string()),
            )
            .await
            .unwrap();

        assert_eq!(summary.loaded, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(ok, vec![1, 2, 4, 5]);
        assert_eq!(errs.len(), 1);
        assert!(errs[0].contains("redacted"));
    }

    #[tokio::test]
    async fn record_contents_appear_when_exposed() {
        let writer = Arc::new(FakeWriter {
            fail_record_numbers: vec![1],
            ..FakeWriter::default()
        });
        let loader = RifLoader::new(writer, 1, 4, true);

        let mut errs = Vec::new();
        loader
            .process_file(1, records(1), &mut |_| {}, &mut |err| {
                errs.push(err.to_string())
            })
            .await
            .unwrap();
        assert!(errs[0].contains("PDE_ID"));
    }

    #[tokio::test]
    async fn parse_errors_skip_persistence() {
        let loader = RifLoader::new(Arc::new(FakeWriter::default()), 2, 4, false);
        let input = vec![
            Ok(RifRecordEvent {
                file_type: RifFileType::Pde,
                record_number: 1,
                fields: vec![],
            }),
            Err(PipelineError::RecordLoad {
                file_type: RifFileType::Pde,
                detail: "malformed RIF row 2".to_string(),
            }),
        ];

        let mut errors = 0u64;
        let summary = loader
            .process_file(1, input.into_iter(), &mut |_| {}, &mut |_| errors += 1)
            .await
            .unwrap();
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(errors, 1);
    }
}

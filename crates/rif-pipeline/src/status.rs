//! Job stage reporting.
//!
//! The load job publishes a small event at every stage transition so an
//! operator can see what the pipeline is doing and which data set it
//! last finished. The default publisher writes structured log lines;
//! tests plug in a recording publisher.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::info;

/// Where the load job currently is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    CheckingBucketForManifest,
    AwaitingManifestDataFiles,
    ProcessingManifestDataFiles,
    CompletedManifest,
    Idle,
}

impl JobStage {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::CheckingBucketForManifest => "checking_bucket_for_manifest",
            JobStage::AwaitingManifestDataFiles => "awaiting_manifest_data_files",
            JobStage::ProcessingManifestDataFiles => "processing_manifest_data_files",
            JobStage::CompletedManifest => "completed_manifest",
            JobStage::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusEvent {
    pub stage: JobStage,
    pub current_manifest_key: Option<String>,
    pub current_timestamp: DateTime<Utc>,
    pub last_completed_manifest_key: Option<String>,
    pub last_completed_timestamp: Option<DateTime<Utc>>,
}

pub trait StatusPublisher: Send + Sync {
    fn publish(&self, event: JobStatusEvent);
}

/// Publishes stage transitions as log lines.
#[derive(Debug, Default)]
pub struct LogStatusPublisher;

impl StatusPublisher for LogStatusPublisher {
    fn publish(&self, event: JobStatusEvent) {
        info!(
            stage = event.stage.as_str(),
            current_manifest = event.current_manifest_key.as_deref(),
            last_completed_manifest = event.last_completed_manifest_key.as_deref(),
            "job status"
        );
    }
}

/// Collects published events for assertions.
#[derive(Debug, Default)]
pub struct RecordingStatusPublisher {
    events: Mutex<Vec<JobStatusEvent>>,
}

impl RecordingStatusPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobStatusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn stages(&self) -> Vec<JobStage> {
        self.events.lock().unwrap().iter().map(|e| e.stage).collect()
    }
}

impl StatusPublisher for RecordingStatusPublisher {
    fn publish(&self, event: JobStatusEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Stamps stage transitions with the last completed data set and hands
/// them to the publisher.
pub struct StatusReporter {
    publisher: std::sync::Arc<dyn StatusPublisher>,
    last_completed: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl StatusReporter {
    pub fn new(publisher: std::sync::Arc<dyn StatusPublisher>) -> Self {
        Self {
            publisher,
            last_completed: Mutex::new(None),
        }
    }

    pub fn report(&self, stage: JobStage, current_manifest_key: Option<&str>) {
        let last = self.last_completed.lock().unwrap().clone();
        self.publisher.publish(JobStatusEvent {
            stage,
            current_manifest_key: current_manifest_key.map(str::to_string),
            current_timestamp: Utc::now(),
            last_completed_manifest_key: last.as_ref().map(|(key, _)| key.clone()),
            last_completed_timestamp: last.map(|(_, at)| at),
        });
    }

    /// Reports completion and remembers the manifest for later events.
    pub fn report_completed(&self, manifest_key: &str) {
        *self.last_completed.lock().unwrap() = Some((manifest_key.to_string(), Utc::now()));
        self.report(JobStage::CompletedManifest, Some(manifest_key));
    }
}

//! Pipeline-specific error types

use rif_common::RifFileType;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Errors raised by the extraction and loading pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A manifest failed XML parsing or schema-level validation. These are
    /// never retried within a process lifetime; the queue records the
    /// manifest as known-invalid and skips it.
    #[error("Invalid manifest at '{s3_key}': {message}")]
    InvalidManifest { s3_key: String, message: String },

    /// An object store request failed. The AWS SDK's operation-specific
    /// error types are flattened to their display form here.
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// An asynchronous download failed. Cloneable detail because download
    /// results are shared between the current-manifest path and prefetch.
    #[error("Download failed for '{s3_key}': {message}")]
    Download { s3_key: String, message: String },

    /// A status transition that the state machine forbids, e.g. restarting
    /// a completed manifest.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    /// A single record failed to persist. Isolated per record; never aborts
    /// sibling records in the same window.
    #[error("Failed to load {file_type} record: {detail}")]
    RecordLoad {
        file_type: RifFileType,
        detail: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A background task was cancelled or panicked.
    #[error("Task failed: {0}")]
    Task(String),

    /// The listener reported an unrecoverable processing failure. This
    /// propagates out of the load job uncaught so the scheduler can react.
    #[error("Data set processing failed: {0}")]
    Listener(String),
}

impl PipelineError {
    /// Flatten an AWS SDK error into an [`PipelineError::ObjectStore`],
    /// preserving the service-level detail that `Display` alone drops.
    pub fn object_store<E>(err: aws_sdk_s3::error::SdkError<E>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match err {
            aws_sdk_s3::error::SdkError::ServiceError(ref service_err) => {
                PipelineError::ObjectStore(format!("{:?}", service_err.err()))
            },
            other => PipelineError::ObjectStore(other.to_string()),
        }
    }
}

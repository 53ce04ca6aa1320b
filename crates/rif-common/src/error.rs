//! Shared error types for the RIF pipeline

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors shared across the workspace
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown RIF file type: {0}")]
    UnknownFileType(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

//! Object store gateway
//!
//! The pipeline only needs a narrow slice of S3: prefix listing, reads,
//! downloads to the local cache, and the copy/delete pair that stands in for
//! rename. Everything S3-specific stays behind the [`ObjectStore`] trait so
//! orchestration code can be exercised against the in-memory store.

use std::path::Path;

use async_trait::async_trait;

use crate::error::PipelineResult;

mod cache;
mod client;
mod memory;

pub use cache::{CachedFile, LocalCache};
pub use client::{S3ObjectStore, StorageConfig};
pub use memory::MemoryObjectStore;

/// The directory name that pending/incoming RIF data sets are pulled from.
pub const S3_PREFIX_PENDING_DATA_SETS: &str = "Incoming";

/// Pending prefix for synthetic data sets. Organizationally separate but
/// not functionally different from [`S3_PREFIX_PENDING_DATA_SETS`].
pub const S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS: &str = "Synthetic/Incoming";

/// Completed data sets are moved here (legacy object-move mode).
pub const S3_PREFIX_COMPLETED_DATA_SETS: &str = "Done";

/// Completed synthetic data sets are moved here.
pub const S3_PREFIX_COMPLETED_SYNTHETIC_DATA_SETS: &str = "Synthetic/Done";

/// Synthetic data sets that failed pre-validation are moved here.
pub const S3_PREFIX_FAILED_SYNTHETIC_DATA_SETS: &str = "Synthetic/Failed";

/// Non-synthetic data sets that were rejected are moved here.
pub const S3_PREFIX_FAILED_DATA_SETS: &str = "Failed";

/// Narrow object-store surface consumed by the queue and load job.
///
/// Existence checks deliberately go through [`list_keys_with_prefix`]
/// rather than per-object probes: one listing answers "are all N entries
/// present" without exception-driven control flow, and handles the
/// eventual-consistency gap between list and get uniformly.
///
/// [`list_keys_with_prefix`]: ObjectStore::list_keys_with_prefix
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// All object keys under `prefix`. Pagination is handled internally;
    /// callers always see the complete listing.
    async fn list_keys_with_prefix(&self, prefix: &str) -> PipelineResult<Vec<String>>;

    /// Reads an object fully into memory. Manifests are small; data files
    /// go through [`download_to_file`](ObjectStore::download_to_file).
    async fn read_object(&self, key: &str) -> PipelineResult<Vec<u8>>;

    /// Streams an object to a local file, returning the byte count.
    async fn download_to_file(&self, key: &str, dest: &Path) -> PipelineResult<u64>;

    /// Size of an object in bytes. Errors when the object is absent.
    async fn object_size(&self, key: &str) -> PipelineResult<u64>;

    /// Server-side copy. Combined with delete this approximates a rename;
    /// the pair is not atomic and a mid-operation failure can orphan the
    /// copy. Accepted risk, not retried.
    async fn copy_object(&self, from_key: &str, to_key: &str) -> PipelineResult<()>;

    /// Deletes an object.
    async fn delete_object(&self, key: &str) -> PipelineResult<()>;
}

//! Local download cache for data set files
//!
//! Entries are downloaded into a configured directory before parsing. The
//! cache tracks how many bytes it currently holds so prefetch can be gated
//! on the remaining budget. Handles own cleanup: whoever consumes a
//! [`CachedFile`] is responsible for calling `delete()` when done; a leaked
//! handle wastes disk space but not correctness.

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use tracing::{debug, warn};

use super::ObjectStore;
use crate::error::PipelineResult;

/// Directory of locally cached S3 downloads with byte accounting.
#[derive(Clone)]
pub struct LocalCache {
    dir: PathBuf,
    budget_bytes: u64,
    used_bytes: Arc<AtomicU64>,
}

impl LocalCache {
    /// Creates the cache directory if needed. `budget_bytes` is the disk
    /// space this cache is allowed to consume; the prefetch gate reads the
    /// unconsumed remainder via [`available_bytes`](Self::available_bytes).
    pub fn new(dir: impl Into<PathBuf>, budget_bytes: u64) -> PipelineResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            budget_bytes,
            used_bytes: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Bytes of the configured budget not currently held by cached files.
    pub fn available_bytes(&self) -> u64 {
        self.budget_bytes
            .saturating_sub(self.used_bytes.load(Ordering::Relaxed))
    }

    /// Downloads `s3_key` into the cache, returning an owning handle.
    pub async fn download(
        &self,
        store: &dyn ObjectStore,
        s3_key: &str,
    ) -> PipelineResult<CachedFile> {
        let path = self.dir.join(sanitize_key(s3_key));
        let len = store.download_to_file(s3_key, &path).await?;
        self.used_bytes.fetch_add(len, Ordering::Relaxed);
        debug!(s3_key, len, path = %path.display(), "Cached data set file");
        Ok(CachedFile {
            s3_key: s3_key.to_string(),
            path,
            len,
            used_bytes: Arc::clone(&self.used_bytes),
            deleted: AtomicBool::new(false),
        })
    }
}

/// A locally cached copy of one S3 object. Deleting is idempotent and
/// releases the file's bytes back to the cache budget.
#[derive(Debug)]
pub struct CachedFile {
    s3_key: String,
    path: PathBuf,
    len: u64,
    used_bytes: Arc<AtomicU64>,
    deleted: AtomicBool,
}

impl CachedFile {
    pub fn s3_key(&self) -> &str {
        &self.s3_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Removes the local file and returns its bytes to the budget.
    pub fn delete(&self) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove cached file");
        }
        self.used_bytes.fetch_sub(self.len, Ordering::Relaxed);
    }
}

fn sanitize_key(s3_key: &str) -> String {
    s3_key.replace(['/', ':'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::MemoryObjectStore;

    #[tokio::test]
    async fn download_and_delete_round_trip_budget() {
        let temp = tempfile::tempdir().unwrap();
        let store = MemoryObjectStore::new(500);
        store.put("Incoming/2024-01-19T16:16:38Z/bene.rif", b"0123456789".to_vec());

        let cache = LocalCache::new(temp.path(), 100).unwrap();
        assert_eq!(cache.available_bytes(), 100);

        let cached = cache
            .download(&store, "Incoming/2024-01-19T16:16:38Z/bene.rif")
            .await
            .unwrap();
        assert_eq!(cached.len(), 10);
        assert_eq!(cache.available_bytes(), 90);
        assert_eq!(std::fs::read(cached.path()).unwrap(), b"0123456789");

        cached.delete();
        assert!(!cached.path().exists());
        assert_eq!(cache.available_bytes(), 100);

        // Second delete is a no-op.
        cached.delete();
        assert_eq!(cache.available_bytes(), 100);
    }
}

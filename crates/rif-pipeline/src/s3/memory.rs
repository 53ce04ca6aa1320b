//! In-memory object store used by tests and local development
//!
//! Listing is paged at a configurable size so code that must tolerate
//! paginated listings actually exercises page boundaries.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::ObjectStore;
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    read_counts: Mutex<HashMap<String, usize>>,
    page_size: usize,
}

impl MemoryObjectStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            read_counts: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    pub fn put(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// How many times `key` has been read or downloaded. Used to verify
    /// download de-duplication.
    pub fn read_count(&self, key: &str) -> usize {
        self.read_counts
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn record_read(&self, key: &str) {
        *self
            .read_counts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_insert(0) += 1;
    }

    fn get(&self, key: &str) -> PipelineResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::ObjectStore(format!("no such key: {key}")))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_keys_with_prefix(&self, prefix: &str) -> PipelineResult<Vec<String>> {
        // Simulate paginated ListObjectsV2: fetch page_size keys at a time,
        // resuming after the last key of the previous page.
        let mut keys = Vec::new();
        let mut start_after: Option<String> = None;

        loop {
            let objects = self.objects.lock().unwrap();
            let page: Vec<String> = objects
                .range::<String, _>(..)
                .map(|(k, _)| k)
                .filter(|k| k.starts_with(prefix))
                .filter(|k| match &start_after {
                    Some(last) => k.as_str() > last.as_str(),
                    None => true,
                })
                .take(self.page_size)
                .cloned()
                .collect();
            drop(objects);

            let page_len = page.len();
            if let Some(last) = page.last() {
                start_after = Some(last.clone());
            }
            keys.extend(page);
            if page_len < self.page_size {
                break;
            }
        }

        Ok(keys)
    }

    async fn read_object(&self, key: &str) -> PipelineResult<Vec<u8>> {
        self.record_read(key);
        self.get(key)
    }

    async fn download_to_file(&self, key: &str, dest: &Path) -> PipelineResult<u64> {
        self.record_read(key);
        let bytes = self.get(key)?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn object_size(&self, key: &str) -> PipelineResult<u64> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|bytes| bytes.len() as u64)
            .ok_or_else(|| PipelineError::ObjectStore(format!("no such key: {key}")))
    }

    async fn copy_object(&self, from_key: &str, to_key: &str) -> PipelineResult<()> {
        let bytes = self.get(from_key)?;
        self.put(to_key, bytes);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> PipelineResult<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

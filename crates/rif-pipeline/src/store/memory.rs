//! In-memory [`ManifestStore`] used by unit and orchestration tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{DataFileRecord, DataSetFilter, FileStatus, ManifestRecord, ManifestStore};
use crate::error::{PipelineError, PipelineResult};
use crate::manifest::DataSetManifest;

#[derive(Debug)]
struct StoredManifest {
    record_id: i64,
    s3_key: String,
    manifest: DataSetManifest,
    status: FileStatus,
    files: Vec<DataFileRecord>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    manifests: Vec<StoredManifest>,
}

#[derive(Debug, Default)]
pub struct MemoryManifestStore {
    inner: Mutex<Inner>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_of(stored: &StoredManifest) -> ManifestRecord {
        ManifestRecord {
            record_id: stored.record_id,
            manifest: stored.manifest.clone(),
            status: stored.status,
            files: stored.files.clone(),
        }
    }
}

#[async_trait]
impl ManifestStore for MemoryManifestStore {
    async fn insert_or_read_manifest(
        &self,
        manifest: &DataSetManifest,
    ) -> PipelineResult<ManifestRecord> {
        let s3_key = manifest.incoming_s3_key();
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner.manifests.iter().find(|m| m.s3_key == s3_key) {
            return Ok(Self::record_of(existing));
        }

        let record_id = inner.next_id;
        inner.next_id += 1;
        let files = manifest
            .entries()
            .iter()
            .enumerate()
            .map(|(i, entry)| DataFileRecord {
                record_id: record_id * 1000 + i as i64,
                file_name: entry.name.clone(),
                status: FileStatus::Discovered,
            })
            .collect();
        let stored = StoredManifest {
            record_id,
            s3_key,
            manifest: manifest.clone(),
            status: FileStatus::Discovered,
            files,
        };
        let record = Self::record_of(&stored);
        inner.manifests.push(stored);
        Ok(record)
    }

    async fn read_ineligible_manifest_s3_keys(
        &self,
        min_timestamp: DateTime<Utc>,
    ) -> PipelineResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .manifests
            .iter()
            .filter(|m| m.manifest.timestamp() >= min_timestamp)
            .filter(|m| !m.files.iter().any(|f| f.status.is_incomplete()))
            .map(|m| m.s3_key.clone())
            .collect())
    }

    async fn read_eligible_manifests(
        &self,
        now: DateTime<Utc>,
        min_timestamp: DateTime<Utc>,
        filter: DataSetFilter,
        limit: u32,
    ) -> PipelineResult<Vec<ManifestRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<ManifestRecord> = inner
            .manifests
            .iter()
            .filter(|m| m.manifest.timestamp() >= min_timestamp)
            .filter(|m| m.manifest.timestamp() < now)
            .filter(|m| filter.matches(m.manifest.is_synthetic_data()))
            .filter(|m| m.files.iter().any(|f| f.status.is_incomplete()))
            .map(Self::record_of)
            .collect();
        records.sort_by(|a, b| a.manifest.id().cmp(b.manifest.id()));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn update_manifest_and_files(
        &self,
        record_id: i64,
        status: FileStatus,
    ) -> PipelineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner
            .manifests
            .iter_mut()
            .find(|m| m.record_id == record_id)
            .ok_or_else(|| {
                PipelineError::Config(format!("no tracked manifest with id {record_id}"))
            })?;
        stored.status = stored.status.transition_to(status)?;
        for file in &mut stored.files {
            if file.status.is_incomplete() {
                file.status = status;
            }
        }
        Ok(())
    }

    async fn update_file_status(
        &self,
        file_record_id: i64,
        status: FileStatus,
    ) -> PipelineResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for stored in &mut inner.manifests {
            if let Some(file) = stored
                .files
                .iter_mut()
                .find(|f| f.record_id == file_record_id)
            {
                file.status = file.status.transition_to(status)?;
                return Ok(());
            }
        }
        Err(PipelineError::Config(format!(
            "no tracked data file with id {file_record_id}"
        )))
    }
}

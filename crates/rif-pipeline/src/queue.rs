//! Discovery and ordered queuing of data sets awaiting load.
//!
//! `DataSetQueue` ties the bucket scan, the manifest parser, the tracking
//! store, and the local download cache together. It owns three rules the
//! rest of the pipeline relies on:
//!
//! * eligible manifests come back oldest first, ordered by
//!   `(timestamp, sequence id)`;
//! * at most one manifest is ever in progress: while a STARTED manifest
//!   exists, it is the only manifest offered;
//! * each data file is downloaded at most once, no matter how many
//!   callers ask for it concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::manifest::{DataSetManifest, ManifestParser};
use crate::s3::{
    CachedFile, LocalCache, ObjectStore, S3_PREFIX_PENDING_DATA_SETS,
    S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS,
};
use crate::store::{DataSetFilter, FileStatus, ManifestRecord, ManifestStore};

/// Manifests older than this are left alone entirely: not parsed, not
/// tracked, not loaded.
pub const MAX_MANIFEST_AGE_DAYS: i64 = 60;

/// Upper bound on manifests considered per scan. Anything beyond this is
/// picked up by a later scan once earlier manifests complete.
pub const MAX_MANIFESTS_TO_PROCESS: u32 = 500;

/// A de-duplicated download. Cloning is cheap and every clone resolves to
/// the same underlying transfer.
pub type SharedDownload = Shared<BoxFuture<'static, Result<Arc<CachedFile>, String>>>;

pub struct DataSetQueue {
    object_store: Arc<dyn ObjectStore>,
    store: Arc<dyn ManifestStore>,
    parser: ManifestParser,
    cache: Arc<LocalCache>,
    filter: DataSetFilter,
    /// Manifest keys that failed validation. Skipped for the rest of the
    /// process lifetime so one bad manifest cannot wedge the scan loop.
    known_invalid: Mutex<HashSet<String>>,
    downloads: Mutex<HashMap<String, SharedDownload>>,
}

impl DataSetQueue {
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        store: Arc<dyn ManifestStore>,
        cache: Arc<LocalCache>,
        filter: DataSetFilter,
    ) -> Self {
        Self {
            object_store,
            store,
            parser: ManifestParser::new(),
            cache,
            filter,
            known_invalid: Mutex::new(HashSet::new()),
            downloads: Mutex::new(HashMap::new()),
        }
    }

    /// Scans both pending prefixes for manifests, tracks the new ones, and
    /// returns the manifests still needing work, oldest first.
    ///
    /// Invalid manifests are logged, remembered, and skipped. If some
    /// manifest is already STARTED it is returned alone, so that a data
    /// set interrupted by a restart finishes before anything newer begins.
    pub async fn read_eligible_manifests(
        &self,
        now: DateTime<Utc>,
    ) -> PipelineResult<Vec<ManifestRecord>> {
        let min_timestamp = now - Duration::days(MAX_MANIFEST_AGE_DAYS);
        self.scan_s3_for_manifests(now, min_timestamp).await?;

        let records = self
            .store
            .read_eligible_manifests(now, min_timestamp, self.filter, MAX_MANIFESTS_TO_PROCESS)
            .await?;

        // Mutual exclusion: an in-progress manifest preempts the rest.
        if let Some(started) = records.iter().find(|r| r.status == FileStatus::Started) {
            return Ok(vec![started.clone()]);
        }
        Ok(records)
    }

    /// Lists both pending prefixes and ensures every processable manifest
    /// is tracked in the store.
    async fn scan_s3_for_manifests(
        &self,
        now: DateTime<Utc>,
        min_timestamp: DateTime<Utc>,
    ) -> PipelineResult<()> {
        let ineligible: HashSet<String> = self
            .store
            .read_ineligible_manifest_s3_keys(min_timestamp)
            .await?
            .into_iter()
            .collect();

        let mut keys = self
            .object_store
            .list_keys_with_prefix(&format!("{S3_PREFIX_PENDING_DATA_SETS}/"))
            .await?;
        keys.extend(
            self.object_store
                .list_keys_with_prefix(&format!("{S3_PREFIX_PENDING_SYNTHETIC_DATA_SETS}/"))
                .await?,
        );

        for key in keys {
            let Some(id) = crate::manifest::ManifestId::parse_from_s3_key(&key) else {
                continue;
            };
            if id.is_future(now) {
                debug!(%key, "skipping future-dated manifest");
                continue;
            }
            if id.timestamp() < min_timestamp {
                debug!(%key, "skipping manifest older than the age window");
                continue;
            }
            if ineligible.contains(&key) || self.known_invalid.lock().unwrap().contains(&key) {
                continue;
            }

            let xml = self.object_store.read_object(&key).await?;
            let manifest = match self.parser.parse(&key, &xml) {
                Ok(manifest) => manifest,
                Err(err) => {
                    error!(%key, %err, "ignoring invalid manifest");
                    self.known_invalid.lock().unwrap().insert(key);
                    continue;
                }
            };
            if !self.filter.matches(manifest.is_synthetic_data()) {
                debug!(%key, "manifest excluded by data set filter");
                continue;
            }
            self.store.insert_or_read_manifest(&manifest).await?;
        }
        Ok(())
    }

    /// Whether every data file named by the manifest is present in the
    /// bucket. One prefix listing answers for all entries at once.
    pub async fn all_entries_exist_in_s3(&self, manifest: &DataSetManifest) -> PipelineResult<bool> {
        let prefix = format!(
            "{}/{}/",
            manifest.incoming_location(),
            manifest.timestamp_text()
        );
        let present: HashSet<String> = self
            .object_store
            .list_keys_with_prefix(&prefix)
            .await?
            .into_iter()
            .collect();
        Ok(manifest.entries().iter().all(|entry| {
            present.contains(&manifest.entry_s3_key(&entry.name, manifest.incoming_location()))
        }))
    }

    /// Starts (or joins) the download of one manifest entry. Concurrent
    /// and repeated calls for the same key share a single transfer.
    pub fn download_manifest_entry(
        &self,
        manifest: &DataSetManifest,
        entry_name: &str,
    ) -> SharedDownload {
        let s3_key = manifest.entry_s3_key(entry_name, manifest.incoming_location());
        let mut downloads = self.downloads.lock().unwrap();
        if let Some(existing) = downloads.get(&s3_key) {
            return existing.clone();
        }

        let object_store = Arc::clone(&self.object_store);
        let cache = Arc::clone(&self.cache);
        let key_for_future = s3_key.clone();
        let download: SharedDownload = async move {
            cache
                .download(object_store.as_ref(), &key_for_future)
                .await
                .map(Arc::new)
                .map_err(|err| err.to_string())
        }
        .boxed()
        .shared();
        downloads.insert(s3_key, download.clone());
        download
    }

    /// Awaits a shared download, converting a shared failure back into a
    /// pipeline error for the caller.
    pub async fn await_download(
        &self,
        manifest: &DataSetManifest,
        entry_name: &str,
        download: SharedDownload,
    ) -> PipelineResult<Arc<CachedFile>> {
        download.await.map_err(|message| PipelineError::Download {
            s3_key: manifest.entry_s3_key(entry_name, manifest.incoming_location()),
            message,
        })
    }

    /// Bytes of local cache budget still available for prefetching.
    pub fn available_disk_space_in_bytes(&self) -> u64 {
        self.cache.available_bytes()
    }

    /// Total size of the data set's files in the bucket, for sizing a
    /// prefetch against the remaining cache budget.
    pub async fn data_set_size_in_bytes(&self, manifest: &DataSetManifest) -> PipelineResult<u64> {
        let mut total = 0;
        for entry in manifest.entries() {
            total += self
                .object_store
                .object_size(&manifest.entry_s3_key(&entry.name, manifest.incoming_location()))
                .await?;
        }
        Ok(total)
    }

    /// Forgets one file's memoized download. Called once its local copy
    /// has been consumed and deleted, so a later request starts a fresh
    /// transfer instead of resolving to the dead cache entry.
    pub fn evict_download(&self, s3_key: &str) {
        self.downloads.lock().unwrap().remove(s3_key);
    }

    pub async fn mark_as_started(&self, record: &ManifestRecord) -> PipelineResult<()> {
        info!(manifest = %record.manifest.id(), "data set load starting");
        self.store
            .update_manifest_and_files(record.record_id, FileStatus::Started)
            .await
    }

    pub async fn mark_file_completed(&self, file_record_id: i64) -> PipelineResult<()> {
        self.store
            .update_file_status(file_record_id, FileStatus::Completed)
            .await
    }

    /// Records a finished data set and forgets its downloads so the cache
    /// entries can be reclaimed.
    pub async fn mark_as_processed(&self, record: &ManifestRecord) -> PipelineResult<()> {
        self.store
            .update_manifest_and_files(record.record_id, FileStatus::Completed)
            .await?;
        self.forget_downloads(&record.manifest);
        info!(manifest = %record.manifest.id(), "data set load complete");
        Ok(())
    }

    pub async fn mark_as_rejected(&self, record: &ManifestRecord) -> PipelineResult<()> {
        self.store
            .update_manifest_and_files(record.record_id, FileStatus::Rejected)
            .await?;
        self.forget_downloads(&record.manifest);
        warn!(manifest = %record.manifest.id(), "data set rejected");
        Ok(())
    }

    /// Moves the manifest and all of its data files out of the pending
    /// tree via copy-then-delete. `destination` is the completed or
    /// failed prefix for the manifest's origin.
    pub async fn move_manifest_files(
        &self,
        manifest: &DataSetManifest,
        destination: &str,
    ) -> PipelineResult<()> {
        let mut keys = vec![(
            manifest.incoming_s3_key(),
            manifest.id().compute_s3_key(destination),
        )];
        for entry in manifest.entries() {
            keys.push((
                manifest.entry_s3_key(&entry.name, manifest.incoming_location()),
                manifest.entry_s3_key(&entry.name, destination),
            ));
        }
        for (from, to) in keys {
            self.object_store.copy_object(&from, &to).await?;
            self.object_store.delete_object(&from).await?;
        }
        debug!(manifest = %manifest.id(), destination, "moved data set objects");
        Ok(())
    }

    fn forget_downloads(&self, manifest: &DataSetManifest) {
        let mut downloads = self.downloads.lock().unwrap();
        for entry in manifest.entries() {
            downloads.remove(&manifest.entry_s3_key(&entry.name, manifest.incoming_location()));
        }
    }

    /// Drops any in-flight download handles. Called on shutdown.
    pub fn close(&self) {
        self.downloads.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestParser;
    use crate::s3::MemoryObjectStore;
    use crate::store::MemoryManifestStore;
    use tempfile::TempDir;

    const NOW: &str = "2024-03-01T12:00:00Z";

    fn now() -> DateTime<Utc> {
        NOW.parse().unwrap()
    }

    fn manifest_xml(entries: &[(&str, &str)]) -> String {
        let mut xml = String::from(
            r#"<dataSetManifest timestamp="T" sequenceId="S">"#,
        );
        for (name, file_type) in entries {
            xml.push_str(&format!(r#"<entry name="{name}" type="{file_type}"/>"#));
        }
        xml.push_str("</dataSetManifest>");
        xml
    }

    fn put_manifest(
        store: &MemoryObjectStore,
        prefix: &str,
        timestamp: &str,
        sequence: u32,
        entries: &[(&str, &str)],
    ) -> String {
        let key = format!("{prefix}/{timestamp}/{sequence}_manifest.xml");
        let xml = manifest_xml(entries)
            .replace("timestamp=\"T\"", &format!("timestamp=\"{timestamp}\""))
            .replace("sequenceId=\"S\"", &format!("sequenceId=\"{sequence}\""));
        store.put(&key, xml.into_bytes());
        for (name, _) in entries {
            store.put(&format!("{prefix}/{timestamp}/{name}"), b"data".to_vec());
        }
        key
    }

    fn queue_with(
        object_store: Arc<MemoryObjectStore>,
        filter: DataSetFilter,
        cache_dir: &TempDir,
    ) -> DataSetQueue {
        let cache = LocalCache::new(cache_dir.path(), 1024 * 1024).unwrap();
        DataSetQueue::new(
            object_store,
            Arc::new(MemoryManifestStore::new()),
            Arc::new(cache),
            filter,
        )
    }

    #[tokio::test]
    async fn eligible_manifests_come_back_oldest_first() {
        let objects = Arc::new(MemoryObjectStore::new(1000));
        put_manifest(&objects, "Incoming", "2024-02-20T10:00:00Z", 1, &[("b.rif", "PDE")]);
        put_manifest(&objects, "Incoming", "2024-02-10T10:00:00Z", 0, &[("a.rif", "PDE")]);
        put_manifest(&objects, "Incoming", "2024-02-10T10:00:00Z", 2, &[("c.rif", "PDE")]);

        let dir = TempDir::new().unwrap();
        let queue = queue_with(objects, DataSetFilter::All, &dir);
        let records = queue.read_eligible_manifests(now()).await.unwrap();

        let order: Vec<_> = records
            .iter()
            .map(|r| (r.manifest.timestamp_text().to_string(), r.manifest.sequence_id()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("2024-02-10T10:00:00Z".to_string(), 0),
                ("2024-02-10T10:00:00Z".to_string(), 2),
                ("2024-02-20T10:00:00Z".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn old_and_future_manifests_are_excluded() {
        let objects = Arc::new(MemoryObjectStore::new(1000));
        // 61 days old, outside the age window.
        put_manifest(&objects, "Incoming", "2023-12-30T12:00:00Z", 0, &[("a.rif", "PDE")]);
        // Dated in the future, pre-staged synthetic convention.
        put_manifest(&objects, "Incoming", "2024-06-01T00:00:00Z", 0, &[("b.rif", "PDE")]);
        // Inside the window.
        put_manifest(&objects, "Incoming", "2024-02-28T00:00:00Z", 0, &[("c.rif", "PDE")]);

        let dir = TempDir::new().unwrap();
        let queue = queue_with(objects, DataSetFilter::All, &dir);
        let records = queue.read_eligible_manifests(now()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].manifest.timestamp_text(), "2024-02-28T00:00:00Z");
    }

    #[tokio::test]
    async fn invalid_manifests_are_skipped_and_remembered() {
        let objects = Arc::new(MemoryObjectStore::new(1000));
        objects.put(
            "Incoming/2024-02-15T00:00:00Z/0_manifest.xml",
            b"<dataSetManifest".to_vec(),
        );
        put_manifest(&objects, "Incoming", "2024-02-28T00:00:00Z", 0, &[("c.rif", "PDE")]);

        let dir = TempDir::new().unwrap();
        let queue = queue_with(Arc::clone(&objects), DataSetFilter::All, &dir);

        let records = queue.read_eligible_manifests(now()).await.unwrap();
        assert_eq!(records.len(), 1);

        // Second scan does not re-read the bad manifest.
        let reads_after_first = objects.read_count("Incoming/2024-02-15T00:00:00Z/0_manifest.xml");
        queue.read_eligible_manifests(now()).await.unwrap();
        assert_eq!(
            objects.read_count("Incoming/2024-02-15T00:00:00Z/0_manifest.xml"),
            reads_after_first
        );
    }

    #[tokio::test]
    async fn filter_excludes_other_origin() {
        let objects = Arc::new(MemoryObjectStore::new(1000));
        put_manifest(&objects, "Incoming", "2024-02-10T10:00:00Z", 0, &[("a.rif", "PDE")]);
        let synthetic_xml = r#"<dataSetManifest timestamp="2024-02-11T10:00:00Z" sequenceId="0" syntheticData="true"><entry name="s.rif" type="PDE"/></dataSetManifest>"#;
        objects.put(
            "Synthetic/Incoming/2024-02-11T10:00:00Z/0_manifest.xml",
            synthetic_xml.as_bytes().to_vec(),
        );

        let dir = TempDir::new().unwrap();
        let queue = queue_with(objects, DataSetFilter::ProductionOnly, &dir);
        let records = queue.read_eligible_manifests(now()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].manifest.is_synthetic_data());
    }

    #[tokio::test]
    async fn started_manifest_is_offered_alone() {
        let objects = Arc::new(MemoryObjectStore::new(1000));
        put_manifest(&objects, "Incoming", "2024-02-10T10:00:00Z", 0, &[("a.rif", "PDE")]);
        put_manifest(&objects, "Incoming", "2024-02-20T10:00:00Z", 0, &[("b.rif", "PDE")]);

        let dir = TempDir::new().unwrap();
        let queue = queue_with(objects, DataSetFilter::All, &dir);

        let records = queue.read_eligible_manifests(now()).await.unwrap();
        assert_eq!(records.len(), 2);
        // Start the NEWER one, as if a restart left it in progress.
        queue.mark_as_started(&records[1]).await.unwrap();

        let records = queue.read_eligible_manifests(now()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].manifest.timestamp_text(), "2024-02-20T10:00:00Z");
    }

    #[tokio::test]
    async fn completed_manifests_never_return() {
        let objects = Arc::new(MemoryObjectStore::new(1000));
        put_manifest(&objects, "Incoming", "2024-02-10T10:00:00Z", 0, &[("a.rif", "PDE")]);

        let dir = TempDir::new().unwrap();
        let queue = queue_with(objects, DataSetFilter::All, &dir);

        let records = queue.read_eligible_manifests(now()).await.unwrap();
        queue.mark_as_started(&records[0]).await.unwrap();
        let records = queue.read_eligible_manifests(now()).await.unwrap();
        queue.mark_as_processed(&records[0]).await.unwrap();

        assert!(queue.read_eligible_manifests(now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entry_presence_uses_one_listing() {
        let objects = Arc::new(MemoryObjectStore::new(1000));
        let key = "Incoming/2024-02-10T10:00:00Z/0_manifest.xml";
        let xml = manifest_xml(&[("a.rif", "PDE"), ("b.rif", "CARRIER")])
            .replace("timestamp=\"T\"", "timestamp=\"2024-02-10T10:00:00Z\"")
            .replace("sequenceId=\"S\"", "sequenceId=\"0\"");
        objects.put(key, xml.into_bytes());
        objects.put("Incoming/2024-02-10T10:00:00Z/a.rif", b"1".to_vec());

        let manifest = ManifestParser::new()
            .parse(key, &objects.read_object(key).await.unwrap())
            .unwrap();

        let dir = TempDir::new().unwrap();
        let queue = queue_with(Arc::clone(&objects), DataSetFilter::All, &dir);
        assert!(!queue.all_entries_exist_in_s3(&manifest).await.unwrap());

        objects.put("Incoming/2024-02-10T10:00:00Z/b.rif", b"2".to_vec());
        assert!(queue.all_entries_exist_in_s3(&manifest).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_downloads_share_one_transfer() {
        let objects = Arc::new(MemoryObjectStore::new(1000));
        let key = put_manifest(
            &objects,
            "Incoming",
            "2024-02-10T10:00:00Z",
            0,
            &[("a.rif", "PDE")],
        );
        let manifest = ManifestParser::new()
            .parse(&key, &objects.read_object(&key).await.unwrap())
            .unwrap();

        let dir = TempDir::new().unwrap();
        let queue = queue_with(Arc::clone(&objects), DataSetFilter::All, &dir);

        let d1 = queue.download_manifest_entry(&manifest, "a.rif");
        let d2 = queue.download_manifest_entry(&manifest, "a.rif");
        let (f1, f2) = tokio::join!(
            queue.await_download(&manifest, "a.rif", d1),
            queue.await_download(&manifest, "a.rif", d2)
        );
        let f1 = f1.unwrap();
        let f2 = f2.unwrap();
        assert_eq!(f1.path(), f2.path());
        assert_eq!(
            objects.read_count("Incoming/2024-02-10T10:00:00Z/a.rif"),
            1
        );
        f1.delete();
    }

    #[tokio::test]
    async fn data_set_size_sums_every_entry() {
        let objects = Arc::new(MemoryObjectStore::new(1000));
        let key = put_manifest(
            &objects,
            "Incoming",
            "2024-02-10T10:00:00Z",
            0,
            &[("a.rif", "PDE"), ("b.rif", "CARRIER")],
        );
        objects.put("Incoming/2024-02-10T10:00:00Z/a.rif", vec![0; 100]);
        objects.put("Incoming/2024-02-10T10:00:00Z/b.rif", vec![0; 28]);
        let manifest = ManifestParser::new()
            .parse(&key, &objects.read_object(&key).await.unwrap())
            .unwrap();

        let dir = TempDir::new().unwrap();
        let queue = queue_with(Arc::clone(&objects), DataSetFilter::All, &dir);
        assert_eq!(queue.data_set_size_in_bytes(&manifest).await.unwrap(), 128);
    }

    #[tokio::test]
    async fn evicted_downloads_start_a_fresh_transfer() {
        let objects = Arc::new(MemoryObjectStore::new(1000));
        let key = put_manifest(
            &objects,
            "Incoming",
            "2024-02-10T10:00:00Z",
            0,
            &[("a.rif", "PDE")],
        );
        let manifest = ManifestParser::new()
            .parse(&key, &objects.read_object(&key).await.unwrap())
            .unwrap();

        let dir = TempDir::new().unwrap();
        let queue = queue_with(Arc::clone(&objects), DataSetFilter::All, &dir);
        let data_key = "Incoming/2024-02-10T10:00:00Z/a.rif";

        let d1 = queue.download_manifest_entry(&manifest, "a.rif");
        let cached = queue.await_download(&manifest, "a.rif", d1).await.unwrap();
        queue.evict_download(data_key);
        cached.delete();

        // Without eviction this would resolve to the deleted local copy.
        let d2 = queue.download_manifest_entry(&manifest, "a.rif");
        let fresh = queue.await_download(&manifest, "a.rif", d2).await.unwrap();
        assert!(fresh.path().exists());
        assert_eq!(objects.read_count(data_key), 2);
        fresh.delete();
    }

    #[tokio::test]
    async fn moving_files_empties_the_pending_tree() {
        let objects = Arc::new(MemoryObjectStore::new(1000));
        let key = put_manifest(
            &objects,
            "Incoming",
            "2024-02-10T10:00:00Z",
            0,
            &[("a.rif", "PDE")],
        );
        let manifest = ManifestParser::new()
            .parse(&key, &objects.read_object(&key).await.unwrap())
            .unwrap();

        let dir = TempDir::new().unwrap();
        let queue = queue_with(Arc::clone(&objects), DataSetFilter::All, &dir);
        queue
            .move_manifest_files(&manifest, manifest.done_location())
            .await
            .unwrap();

        assert!(objects.contains("Done/2024-02-10T10:00:00Z/0_manifest.xml"));
        assert!(objects.contains("Done/2024-02-10T10:00:00Z/a.rif"));
        assert!(!objects.contains(&key));
        assert!(!objects.contains("Incoming/2024-02-10T10:00:00Z/a.rif"));
    }
}

//! Durable tracking of discovered manifests and their data files.
//!
//! Every manifest found in the bucket is recorded here before any work
//! happens, so that restarts resume exactly where the previous process
//! stopped. The tables are the source of truth for which data sets are
//! still eligible for loading and which are finished.

mod memory;
mod postgres;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{PipelineError, PipelineResult};
use crate::manifest::DataSetManifest;

pub use memory::MemoryManifestStore;
pub use postgres::PgManifestStore;

/// Lifecycle of a single data file within a manifest.
///
/// `Completed` and `Rejected` are terminal. A `Started` file may be
/// started again after a crash, which is why loads must be idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    Discovered,
    Started,
    Completed,
    Rejected,
}

impl FileStatus {
    /// A file still needing work keeps its manifest eligible.
    pub fn is_incomplete(self) -> bool {
        matches!(self, FileStatus::Discovered | FileStatus::Started)
    }

    /// Validates a status change, rejecting transitions out of a
    /// terminal state.
    pub fn transition_to(self, to: FileStatus) -> PipelineResult<FileStatus> {
        let allowed = matches!(
            (self, to),
            (FileStatus::Discovered, FileStatus::Discovered)
                | (FileStatus::Discovered, FileStatus::Started)
                | (FileStatus::Discovered, FileStatus::Rejected)
                | (FileStatus::Started, FileStatus::Started)
                | (FileStatus::Started, FileStatus::Completed)
                | (FileStatus::Started, FileStatus::Rejected)
        );
        if allowed {
            Ok(to)
        } else {
            Err(PipelineError::InvalidStatusTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Discovered => "DISCOVERED",
            FileStatus::Started => "STARTED",
            FileStatus::Completed => "COMPLETED",
            FileStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCOVERED" => Ok(FileStatus::Discovered),
            "STARTED" => Ok(FileStatus::Started),
            "COMPLETED" => Ok(FileStatus::Completed),
            "REJECTED" => Ok(FileStatus::Rejected),
            other => Err(PipelineError::Config(format!(
                "unrecognized file status: {other}"
            ))),
        }
    }
}

/// Which data sets a pipeline instance is willing to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSetFilter {
    #[default]
    All,
    ProductionOnly,
    SyntheticOnly,
}

impl DataSetFilter {
    pub fn matches(self, synthetic_data: bool) -> bool {
        match self {
            DataSetFilter::All => true,
            DataSetFilter::ProductionOnly => !synthetic_data,
            DataSetFilter::SyntheticOnly => synthetic_data,
        }
    }
}

impl FromStr for DataSetFilter {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(DataSetFilter::All),
            "production" => Ok(DataSetFilter::ProductionOnly),
            "synthetic" => Ok(DataSetFilter::SyntheticOnly),
            other => Err(PipelineError::Config(format!(
                "unrecognized data set filter: {other} (expected all, production, or synthetic)"
            ))),
        }
    }
}

/// A tracked data file row.
#[derive(Debug, Clone)]
pub struct DataFileRecord {
    pub record_id: i64,
    pub file_name: String,
    pub status: FileStatus,
}

/// A tracked manifest row together with its file rows.
#[derive(Debug, Clone)]
pub struct ManifestRecord {
    pub record_id: i64,
    pub manifest: DataSetManifest,
    pub status: FileStatus,
    pub files: Vec<DataFileRecord>,
}

impl ManifestRecord {
    /// Eligible means at least one file still needs loading.
    pub fn is_eligible(&self) -> bool {
        self.files.iter().any(|f| f.status.is_incomplete())
    }

    /// The tracking row for the named data file, if one was recorded.
    pub fn file_record(&self, file_name: &str) -> Option<&DataFileRecord> {
        self.files.iter().find(|f| f.file_name == file_name)
    }
}

/// Persistence seam for manifest tracking. The production implementation
/// is [`PgManifestStore`]; tests use [`MemoryManifestStore`].
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Records a newly parsed manifest, or reads back the existing rows
    /// when the manifest was already discovered by an earlier run. Never
    /// resets statuses on re-discovery.
    async fn insert_or_read_manifest(
        &self,
        manifest: &DataSetManifest,
    ) -> PipelineResult<ManifestRecord>;

    /// S3 keys of manifests that no longer need processing (every file
    /// completed or rejected) and that fall inside the age window.
    /// Scanning skips these keys without re-reading their XML.
    async fn read_ineligible_manifest_s3_keys(
        &self,
        min_timestamp: DateTime<Utc>,
    ) -> PipelineResult<Vec<String>>;

    /// Manifests with incomplete files, timestamped inside
    /// `[min_timestamp, now)`, matching `filter`, ordered by
    /// (timestamp, sequence id) ascending, at most `limit` rows.
    async fn read_eligible_manifests(
        &self,
        now: DateTime<Utc>,
        min_timestamp: DateTime<Utc>,
        filter: DataSetFilter,
        limit: u32,
    ) -> PipelineResult<Vec<ManifestRecord>>;

    /// Moves a manifest and all of its files to `status`, enforcing the
    /// transition rules of [`FileStatus::transition_to`] per row.
    async fn update_manifest_and_files(
        &self,
        record_id: i64,
        status: FileStatus,
    ) -> PipelineResult<()>;

    /// Marks a single data file. Used as each file finishes so a crash
    /// mid-manifest only repeats the unfinished files.
    async fn update_file_status(
        &self,
        file_record_id: i64,
        status: FileStatus,
    ) -> PipelineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_files_cannot_restart() {
        let err = FileStatus::Completed
            .transition_to(FileStatus::Started)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidStatusTransition { .. }
        ));
    }

    #[test]
    fn started_files_may_start_again() {
        // A crash between start and completion leaves STARTED rows that
        // the next run picks up again.
        assert_eq!(
            FileStatus::Started.transition_to(FileStatus::Started).unwrap(),
            FileStatus::Started
        );
    }

    #[test]
    fn rejected_is_terminal() {
        assert!(FileStatus::Rejected.transition_to(FileStatus::Started).is_err());
        assert!(FileStatus::Rejected.transition_to(FileStatus::Completed).is_err());
    }

    #[test]
    fn file_records_are_looked_up_by_name() {
        use crate::manifest::{DataSetManifest, DataSetManifestEntry, ManifestId};
        use rif_common::RifFileType;

        let manifest = DataSetManifest::from_parts(
            ManifestId::new("2024-01-19T16:16:38Z".parse().unwrap(), 0),
            false,
            vec![DataSetManifestEntry {
                name: "bene.rif".to_string(),
                file_type: RifFileType::Beneficiary,
            }],
            None,
        );
        let record = ManifestRecord {
            record_id: 1,
            manifest,
            status: FileStatus::Discovered,
            files: vec![DataFileRecord {
                record_id: 7,
                file_name: "bene.rif".to_string(),
                status: FileStatus::Discovered,
            }],
        };

        assert_eq!(record.file_record("bene.rif").unwrap().record_id, 7);
        assert!(record.file_record("carrier.rif").is_none());
    }

    #[test]
    fn filter_matches_by_origin() {
        assert!(DataSetFilter::All.matches(true));
        assert!(DataSetFilter::All.matches(false));
        assert!(DataSetFilter::SyntheticOnly.matches(true));
        assert!(!DataSetFilter::SyntheticOnly.matches(false));
        assert!(DataSetFilter::ProductionOnly.matches(false));
        assert!(!DataSetFilter::ProductionOnly.matches(true));
    }

    #[test]
    fn filter_parses_from_config_strings() {
        assert_eq!("all".parse::<DataSetFilter>().unwrap(), DataSetFilter::All);
        assert_eq!(
            "SYNTHETIC".parse::<DataSetFilter>().unwrap(),
            DataSetFilter::SyntheticOnly
        );
        assert!("everything".parse::<DataSetFilter>().is_err());
    }
}

//! RIF batch and record model.
//!
//! A `RifFilesEvent` is the unit handed to the load listener: one manifest
//! plus a handle per data file. The handles wrap already-running shared
//! downloads, so the listener can start reading whichever file lands
//! first without triggering duplicate transfers.

use std::path::Path;
use std::sync::Arc;

use rif_common::RifFileType;
use serde_json::{Map, Value as JsonValue};

use crate::error::{PipelineError, PipelineResult};
use crate::queue::SharedDownload;
use crate::s3::CachedFile;
use crate::store::ManifestRecord;

/// One manifest's worth of data files, ready for loading.
#[derive(Clone)]
pub struct RifFilesEvent {
    record: ManifestRecord,
    files: Vec<S3RifFile>,
}

impl RifFilesEvent {
    pub fn new(record: ManifestRecord, files: Vec<S3RifFile>) -> Self {
        Self { record, files }
    }

    pub fn manifest_record(&self) -> &ManifestRecord {
        &self.record
    }

    pub fn files(&self) -> &[S3RifFile] {
        &self.files
    }
}

/// A single RIF data file backed by a shared S3 download.
#[derive(Clone)]
pub struct S3RifFile {
    file_name: String,
    file_type: RifFileType,
    file_record_id: i64,
    s3_key: String,
    download: SharedDownload,
}

impl S3RifFile {
    pub fn new(
        file_name: String,
        file_type: RifFileType,
        file_record_id: i64,
        s3_key: String,
        download: SharedDownload,
    ) -> Self {
        Self {
            file_name,
            file_type,
            file_record_id,
            s3_key,
            download,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_type(&self) -> RifFileType {
        self.file_type
    }

    /// Tracking-row id of this file, for per-file status updates.
    pub fn file_record_id(&self) -> i64 {
        self.file_record_id
    }

    pub fn s3_key(&self) -> &str {
        &self.s3_key
    }

    pub fn download(&self) -> SharedDownload {
        self.download.clone()
    }

    /// Waits for the download and returns the local copy.
    pub async fn local_file(&self) -> PipelineResult<Arc<CachedFile>> {
        self.download
            .clone()
            .await
            .map_err(|message| PipelineError::Download {
                s3_key: self.s3_key.clone(),
                message,
            })
    }
}

/// One parsed RIF record: the field values of a single delimited row,
/// paired with its source file type and 1-based row number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RifRecordEvent {
    pub file_type: RifFileType,
    pub record_number: u64,
    pub fields: Vec<(String, String)>,
}

impl RifRecordEvent {
    /// The record as a JSON object, keyed by column header.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            map.insert(name.clone(), JsonValue::String(value.clone()));
        }
        JsonValue::Object(map)
    }
}

/// Streaming reader for pipe-delimited RIF files with a header row.
pub struct RifFileReader {
    file_type: RifFileType,
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<std::fs::File>,
    next_record_number: u64,
}

impl RifFileReader {
    pub fn open(path: &Path, file_type: RifFileType) -> PipelineResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'|')
            .has_headers(true)
            .flexible(false)
            .from_path(path)
            .map_err(|e| {
                PipelineError::RecordLoad {
                    file_type,
                    detail: format!("cannot open RIF file {}: {e}", path.display()),
                }
            })?;
        let headers = reader
            .headers()
            .map_err(|e| PipelineError::RecordLoad {
                file_type,
                detail: format!("cannot read RIF header row: {e}"),
            })?
            .iter()
            .map(str::to_string)
            .collect();
        Ok(Self {
            file_type,
            headers,
            records: reader.into_records(),
            next_record_number: 1,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl Iterator for RifFileReader {
    type Item = PipelineResult<RifRecordEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        let record_number = self.next_record_number;
        self.next_record_number += 1;
        match self.records.next()? {
            Ok(row) => {
                let fields = self
                    .headers
                    .iter()
                    .zip(row.iter())
                    .map(|(h, v)| (h.clone(), v.to_string()))
                    .collect();
                Some(Ok(RifRecordEvent {
                    file_type: self.file_type,
                    record_number,
                    fields,
                }))
            }
            Err(e) => Some(Err(PipelineError::RecordLoad {
                file_type: self.file_type,
                detail: format!("malformed RIF row {record_number}: {e}"),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn reads_pipe_delimited_rows() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "BENE_ID|BENE_BIRTH_DT|STATE_CODE").unwrap();
        writeln!(file, "567834|1981-03-17|MO").unwrap();
        writeln!(file, "567835|1990-06-01|KS").unwrap();
        file.flush().unwrap();

        let reader = RifFileReader::open(file.path(), RifFileType::Beneficiary).unwrap();
        let records: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_number, 1);
        assert_eq!(
            records[0].fields[0],
            ("BENE_ID".to_string(), "567834".to_string())
        );
        assert_eq!(records[1].fields[2].1, "KS");
    }

    #[test]
    fn malformed_rows_surface_as_errors() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "BENE_ID|STATE_CODE").unwrap();
        writeln!(file, "1|MO").unwrap();
        writeln!(file, "2|MO|EXTRA").unwrap();
        file.flush().unwrap();

        let reader = RifFileReader::open(file.path(), RifFileType::Beneficiary).unwrap();
        let results: Vec<_> = reader.collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn record_converts_to_json_object() {
        let record = RifRecordEvent {
            file_type: RifFileType::Pde,
            record_number: 1,
            fields: vec![("PDE_ID".to_string(), "89".to_string())],
        };
        assert_eq!(record.to_json()["PDE_ID"], "89");
    }
}

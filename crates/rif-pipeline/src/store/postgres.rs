//! PostgreSQL-backed manifest tracking.
//!
//! Two tables: `s3_manifest_files` (one row per manifest) and
//! `s3_data_files` (one row per entry). Status updates run in
//! transactions with `FOR UPDATE` reads so concurrent pipelines cannot
//! both claim the same manifest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use super::{DataFileRecord, DataSetFilter, FileStatus, ManifestRecord, ManifestStore};
use crate::error::{PipelineError, PipelineResult};
use crate::manifest::{
    DataSetManifest, DataSetManifestEntry, ManifestId, PreValidationProperties,
};

pub struct PgManifestStore {
    pool: PgPool,
}

impl PgManifestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ManifestRow {
    manifest_id: i64,
    s3_key: String,
    timestamp_text: String,
    sequence_id: i32,
    synthetic_data: bool,
    status: String,
    bene_id_start: Option<i64>,
    bene_id_end: Option<i64>,
    clm_grp_id_start: Option<i64>,
    clm_grp_id_end: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct DataFileRow {
    data_file_id: i64,
    file_name: String,
    file_type: String,
    status: String,
}

const MANIFEST_COLUMNS: &str = "manifest_id, s3_key, timestamp_text, sequence_id, \
     synthetic_data, status, bene_id_start, bene_id_end, clm_grp_id_start, clm_grp_id_end";

fn build_record(manifest_row: ManifestRow, file_rows: Vec<DataFileRow>) -> PipelineResult<ManifestRecord> {
    let sequence_id = u32::try_from(manifest_row.sequence_id).map_err(|_| {
        PipelineError::Config(format!(
            "negative sequence id stored for {}",
            manifest_row.s3_key
        ))
    })?;
    let id = ManifestId::from_timestamp_text(&manifest_row.timestamp_text, sequence_id)?;

    let mut entries = Vec::with_capacity(file_rows.len());
    let mut files = Vec::with_capacity(file_rows.len());
    for row in file_rows {
        let file_type = row.file_type.parse().map_err(|_| {
            PipelineError::Config(format!(
                "unrecognized stored file type '{}' for {}",
                row.file_type, row.file_name
            ))
        })?;
        entries.push(DataSetManifestEntry {
            name: row.file_name.clone(),
            file_type,
        });
        files.push(DataFileRecord {
            record_id: row.data_file_id,
            file_name: row.file_name,
            status: row.status.parse()?,
        });
    }

    let pre_validation = match (
        manifest_row.bene_id_start,
        manifest_row.bene_id_end,
        manifest_row.clm_grp_id_start,
        manifest_row.clm_grp_id_end,
    ) {
        (Some(bs), Some(be), Some(cs), Some(ce)) => Some(PreValidationProperties {
            bene_id_start: bs,
            bene_id_end: be,
            clm_grp_id_start: cs,
            clm_grp_id_end: ce,
        }),
        _ => None,
    };

    Ok(ManifestRecord {
        record_id: manifest_row.manifest_id,
        manifest: DataSetManifest::from_parts(
            id,
            manifest_row.synthetic_data,
            entries,
            pre_validation,
        ),
        status: manifest_row.status.parse()?,
        files,
    })
}

async fn read_files_for_manifest(
    tx: &mut Transaction<'_, Postgres>,
    manifest_id: i64,
) -> PipelineResult<Vec<DataFileRow>> {
    let rows = sqlx::query_as::<_, DataFileRow>(
        "SELECT data_file_id, file_name, file_type, status \
         FROM s3_data_files WHERE manifest_id = $1 ORDER BY data_file_id",
    )
    .bind(manifest_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows)
}

#[async_trait]
impl ManifestStore for PgManifestStore {
    async fn insert_or_read_manifest(
        &self,
        manifest: &DataSetManifest,
    ) -> PipelineResult<ManifestRecord> {
        let s3_key = manifest.incoming_s3_key();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, ManifestRow>(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM s3_manifest_files WHERE s3_key = $1 FOR UPDATE"
        ))
        .bind(&s3_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let files = read_files_for_manifest(&mut tx, row.manifest_id).await?;
            tx.commit().await?;
            debug!(s3_key, "manifest already tracked, read back existing rows");
            return build_record(row, files);
        }

        let pre_validation = manifest.pre_validation();
        let row = sqlx::query_as::<_, ManifestRow>(&format!(
            "INSERT INTO s3_manifest_files \
             (s3_key, timestamp_text, manifest_timestamp, sequence_id, synthetic_data, status, \
              bene_id_start, bene_id_end, clm_grp_id_start, clm_grp_id_end) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {MANIFEST_COLUMNS}"
        ))
        .bind(&s3_key)
        .bind(manifest.timestamp_text())
        .bind(manifest.timestamp())
        .bind(manifest.sequence_id() as i32)
        .bind(manifest.is_synthetic_data())
        .bind(FileStatus::Discovered.as_str())
        .bind(pre_validation.map(|p| p.bene_id_start))
        .bind(pre_validation.map(|p| p.bene_id_end))
        .bind(pre_validation.map(|p| p.clm_grp_id_start))
        .bind(pre_validation.map(|p| p.clm_grp_id_end))
        .fetch_one(&mut *tx)
        .await?;

        for entry in manifest.entries() {
            sqlx::query(
                "INSERT INTO s3_data_files (manifest_id, file_name, file_type, status) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(row.manifest_id)
            .bind(&entry.name)
            .bind(entry.file_type.as_str())
            .bind(FileStatus::Discovered.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let files = read_files_for_manifest(&mut tx, row.manifest_id).await?;
        tx.commit().await?;
        debug!(s3_key, files = files.len(), "tracked new manifest");
        build_record(row, files)
    }

    async fn read_ineligible_manifest_s3_keys(
        &self,
        min_timestamp: DateTime<Utc>,
    ) -> PipelineResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT m.s3_key FROM s3_manifest_files m \
             WHERE m.manifest_timestamp >= $1 \
               AND NOT EXISTS ( \
                 SELECT 1 FROM s3_data_files f \
                 WHERE f.manifest_id = m.manifest_id \
                   AND f.status IN ('DISCOVERED', 'STARTED'))",
        )
        .bind(min_timestamp)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("s3_key")).collect())
    }

    async fn read_eligible_manifests(
        &self,
        now: DateTime<Utc>,
        min_timestamp: DateTime<Utc>,
        filter: DataSetFilter,
        limit: u32,
    ) -> PipelineResult<Vec<ManifestRecord>> {
        let synthetic_filter: Option<bool> = match filter {
            DataSetFilter::All => None,
            DataSetFilter::ProductionOnly => Some(false),
            DataSetFilter::SyntheticOnly => Some(true),
        };

        let manifest_rows = sqlx::query_as::<_, ManifestRow>(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM s3_manifest_files m \
             WHERE m.manifest_timestamp >= $1 \
               AND m.manifest_timestamp < $2 \
               AND ($3::boolean IS NULL OR m.synthetic_data = $3) \
               AND EXISTS ( \
                 SELECT 1 FROM s3_data_files f \
                 WHERE f.manifest_id = m.manifest_id \
                   AND f.status IN ('DISCOVERED', 'STARTED')) \
             ORDER BY m.manifest_timestamp ASC, m.sequence_id ASC \
             LIMIT $4"
        ))
        .bind(min_timestamp)
        .bind(now)
        .bind(synthetic_filter)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(manifest_rows.len());
        for row in manifest_rows {
            let mut tx = self.pool.begin().await?;
            let files = read_files_for_manifest(&mut tx, row.manifest_id).await?;
            tx.commit().await?;
            records.push(build_record(row, files)?);
        }
        Ok(records)
    }

    async fn update_manifest_and_files(
        &self,
        record_id: i64,
        status: FileStatus,
    ) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await?;

        let current: String = sqlx::query(
            "SELECT status FROM s3_manifest_files WHERE manifest_id = $1 FOR UPDATE",
        )
        .bind(record_id)
        .fetch_one(&mut *tx)
        .await?
        .get("status");
        current.parse::<FileStatus>()?.transition_to(status)?;

        sqlx::query(
            "UPDATE s3_manifest_files SET status = $1, status_updated_at = now() \
             WHERE manifest_id = $2",
        )
        .bind(status.as_str())
        .bind(record_id)
        .execute(&mut *tx)
        .await?;

        // Files already in a terminal state keep it; only incomplete
        // files follow the manifest.
        sqlx::query(
            "UPDATE s3_data_files SET status = $1, status_updated_at = now() \
             WHERE manifest_id = $2 AND status IN ('DISCOVERED', 'STARTED')",
        )
        .bind(status.as_str())
        .bind(record_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_file_status(
        &self,
        file_record_id: i64,
        status: FileStatus,
    ) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await?;
        let current: String =
            sqlx::query("SELECT status FROM s3_data_files WHERE data_file_id = $1 FOR UPDATE")
                .bind(file_record_id)
                .fetch_one(&mut *tx)
                .await?
                .get("status");
        current.parse::<FileStatus>()?.transition_to(status)?;

        sqlx::query(
            "UPDATE s3_data_files SET status = $1, status_updated_at = now() \
             WHERE data_file_id = $2",
        )
        .bind(status.as_str())
        .bind(file_record_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

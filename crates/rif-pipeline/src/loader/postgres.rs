//! PostgreSQL record persistence.
//!
//! `loaded_files` gets one row per RIF file load; `loaded_records` one
//! row per record, holding the parsed fields as JSONB. Each record write
//! is its own transaction, which keeps loads idempotent at file-restart
//! granularity without giant multi-million-row transactions.

use rif_common::RifFileType;
use sqlx::{PgPool, Row};

use super::RecordWriter;
use crate::error::PipelineResult;
use crate::rif::RifRecordEvent;

pub struct PgRecordWriter {
    pool: PgPool,
}

impl PgRecordWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RecordWriter for PgRecordWriter {
    async fn begin_file(
        &self,
        manifest_record_id: i64,
        file_type: RifFileType,
        file_name: &str,
    ) -> PipelineResult<i64> {
        let row = sqlx::query(
            "INSERT INTO loaded_files (manifest_id, file_name, rif_type) \
             VALUES ($1, $2, $3) RETURNING loaded_file_id",
        )
        .bind(manifest_record_id)
        .bind(file_name)
        .bind(file_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("loaded_file_id"))
    }

    async fn write(&self, loaded_file_id: i64, record: &RifRecordEvent) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await?;
        // Re-running a file after a crash replays record numbers; the
        // upsert keeps that replay idempotent.
        sqlx::query(
            "INSERT INTO loaded_records (loaded_file_id, record_number, contents) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (loaded_file_id, record_number) DO UPDATE SET contents = $3",
        )
        .bind(loaded_file_id)
        .bind(record.record_number as i64)
        .bind(record.to_json())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

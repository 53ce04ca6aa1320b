//! Schema migration runner.
//!
//! Migrations live in `migrations/` at the workspace root and run to
//! completion before the pipeline touches any table. A failed migration
//! aborts startup; the pipeline never runs against a half-migrated
//! schema.

use sqlx::PgPool;
use tracing::info;

use crate::error::{PipelineError, PipelineResult};

pub async fn create_or_update_schema(pool: &PgPool) -> PipelineResult<()> {
    info!("applying schema migrations");
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| PipelineError::Config(format!("schema migration failed: {e}")))?;
    info!("schema is current");
    Ok(())
}

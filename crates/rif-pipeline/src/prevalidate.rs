//! Pre-validation of synthetic data sets.
//!
//! Synthetic manifests declare the beneficiary and claim-group id ranges
//! their records occupy. Before loading, those ranges are checked against
//! every range already claimed by another data set; an overlap would
//! violate downstream key constraints, so the data set is rejected instead
//! of loaded. Validation runs again on every load attempt, so a manifest's
//! own claims from an earlier attempt never count against it.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::error::PipelineResult;
use crate::manifest::PreValidationProperties;

#[async_trait]
pub trait PreValidator: Send + Sync {
    /// True when the declared ranges are safe to load. A `false` return
    /// rejects the data set; errors abort the job invocation.
    async fn is_valid(
        &self,
        manifest_s3_key: &str,
        props: &PreValidationProperties,
    ) -> PipelineResult<bool>;
}

/// Range kinds tracked in `synthetic_key_ranges`.
const KIND_BENE: &str = "BENE_ID";
const KIND_CLM_GRP: &str = "CLM_GRP_ID";

/// The declared ranges normalized to `low <= high`. Synthetic ids are
/// negative, so the start attribute is usually the numerically larger end.
fn normalized_ranges(props: &PreValidationProperties) -> [(&'static str, i64, i64); 2] {
    [
        (
            KIND_BENE,
            props.bene_id_start.min(props.bene_id_end),
            props.bene_id_start.max(props.bene_id_end),
        ),
        (
            KIND_CLM_GRP,
            props.clm_grp_id_start.min(props.clm_grp_id_end),
            props.clm_grp_id_start.max(props.clm_grp_id_end),
        ),
    ]
}

/// Database-backed validator. Claims the manifest's ranges inside one
/// transaction, so two pipelines validating overlapping synthetic sets
/// cannot both pass. Claims are recorded against the manifest's S3 key
/// and an exact re-claim by the same manifest always passes.
pub struct PgPreValidator {
    pool: PgPool,
}

impl PgPreValidator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreValidator for PgPreValidator {
    async fn is_valid(
        &self,
        manifest_s3_key: &str,
        props: &PreValidationProperties,
    ) -> PipelineResult<bool> {
        let ranges = normalized_ranges(props);

        let mut tx = self.pool.begin().await?;
        for (kind, low, high) in ranges {
            let overlaps: i64 = sqlx::query(
                "SELECT count(*) AS overlaps FROM ( \
                   SELECT 1 FROM synthetic_key_ranges \
                   WHERE kind = $1 AND low_id <= $3 AND high_id >= $2 \
                     AND manifest_s3_key <> $4 \
                   FOR UPDATE) AS claimed",
            )
            .bind(kind)
            .bind(low)
            .bind(high)
            .bind(manifest_s3_key)
            .fetch_one(&mut *tx)
            .await?
            .get("overlaps");
            if overlaps > 0 {
                warn!(kind, low, high, "synthetic id range already claimed");
                tx.rollback().await?;
                return Ok(false);
            }
        }
        for (kind, low, high) in ranges {
            sqlx::query(
                "INSERT INTO synthetic_key_ranges (manifest_s3_key, kind, low_id, high_id) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (manifest_s3_key, kind) DO NOTHING",
            )
            .bind(manifest_s3_key)
            .bind(kind)
            .bind(low)
            .bind(high)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }
}

/// Fixed-answer validator for tests and for deployments without
/// synthetic data.
pub struct StaticPreValidator {
    valid: bool,
}

impl StaticPreValidator {
    pub fn new(valid: bool) -> Self {
        Self { valid }
    }
}

#[async_trait]
impl PreValidator for StaticPreValidator {
    async fn is_valid(
        &self,
        _manifest_s3_key: &str,
        _props: &PreValidationProperties,
    ) -> PipelineResult<bool> {
        Ok(self.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_normalize_to_low_high_order() {
        let props = PreValidationProperties {
            bene_id_start: -1000,
            bene_id_end: -2000,
            clm_grp_id_start: -10,
            clm_grp_id_end: -20,
        };
        assert_eq!(
            normalized_ranges(&props),
            [(KIND_BENE, -2000, -1000), (KIND_CLM_GRP, -20, -10)]
        );
    }
}

//! Records prebuild create and delete builds for the build executor.

use async_trait::async_trait;
use prewarm_id::{BuildJobId, PresetId, UserId};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{info, instrument};

use crate::prebuilds::{
    parameters_for_preset, DeleteRequest, PrebuildRequest, PresetParameter, ProvisionError,
    Provisioner,
};

/// Postgres-backed provisioner.
///
/// Creating or deleting a prebuild queues a build row; the build executor
/// picks it up and reports the outcome on the same row.
#[derive(Debug, Clone)]
pub struct StoreProvisioner {
    pool: PgPool,
}

impl StoreProvisioner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct ParameterRow(PresetParameter);

impl<'r> sqlx::FromRow<'r, PgRow> for ParameterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let raw_preset: String = row.try_get("preset_id")?;
        let preset_id =
            raw_preset
                .parse::<PresetId>()
                .map_err(|e| sqlx::Error::ColumnDecode {
                    index: "preset_id".to_string(),
                    source: Box::new(e),
                })?;

        Ok(Self(PresetParameter {
            preset_id,
            name: row.try_get("name")?,
            value: row.try_get("value")?,
        }))
    }
}

#[async_trait]
impl Provisioner for StoreProvisioner {
    #[instrument(skip(self, request), fields(prebuild_id = %request.prebuild_id, preset_id = %request.preset_id))]
    async fn create_prebuild(&self, request: &PrebuildRequest) -> Result<BuildJobId, ProvisionError> {
        let mut tx = self.pool.begin().await?;

        let active_version: Option<Option<String>> = sqlx::query_scalar(
            "SELECT active_version_id FROM templates WHERE template_id = $1 AND NOT deleted",
        )
        .bind(request.template_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        match active_version.flatten() {
            Some(active) if active == request.template_version_id.to_string() => {}
            Some(_) => {
                return Err(ProvisionError::Rejected(format!(
                    "template version {} is no longer active",
                    request.template_version_id
                )))
            }
            None => {
                return Err(ProvisionError::Rejected(format!(
                    "template {} has no active version",
                    request.template_id
                )))
            }
        }

        let params: Vec<ParameterRow> = sqlx::query_as(
            r#"
            SELECT pp.preset_id, pp.name, pp.value
            FROM template_version_preset_parameters pp
            JOIN template_version_presets p ON p.preset_id = pp.preset_id
            WHERE p.template_version_id = $1
            ORDER BY pp.name
            "#,
        )
        .bind(request.template_version_id.to_string())
        .fetch_all(&mut *tx)
        .await?;
        let params: Vec<PresetParameter> = params.into_iter().map(|r| r.0).collect();
        let parameters = parameters_for_preset(&params, request.preset_id);
        let parameters = serde_json::to_value(&parameters)
            .map_err(|e| ProvisionError::Rejected(format!("invalid parameters: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO prebuilds (prebuild_id, name, owner_id, template_id, created_at)
            VALUES ($1, $2, $3, $4, now())
            "#,
        )
        .bind(request.prebuild_id.to_string())
        .bind(&request.name)
        .bind(UserId::PREBUILDS_OWNER.to_string())
        .bind(request.template_id.to_string())
        .execute(&mut *tx)
        .await?;

        let job_id = BuildJobId::new();
        sqlx::query(
            r#"
            INSERT INTO prebuild_builds (
                job_id, prebuild_id, build_number, template_version_id, preset_id,
                transition, job_status, parameters, created_at
            )
            VALUES ($1, $2, 1, $3, $4, 'start', 'pending', $5, now())
            "#,
        )
        .bind(job_id.to_string())
        .bind(request.prebuild_id.to_string())
        .bind(request.template_version_id.to_string())
        .bind(request.preset_id.to_string())
        .bind(parameters)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(job_id = %job_id, name = %request.name, "Queued prebuild start build");
        Ok(job_id)
    }

    #[instrument(skip(self, request), fields(prebuild_id = %request.prebuild_id, preset_id = %request.preset_id))]
    async fn delete_prebuild(&self, request: &DeleteRequest) -> Result<BuildJobId, ProvisionError> {
        let job_id = BuildJobId::new();

        // Only delete while the prebuilds owner still holds the workspace;
        // the row lock serializes this against a concurrent claim.
        let result = sqlx::query(
            r#"
            INSERT INTO prebuild_builds (
                job_id, prebuild_id, build_number, template_version_id, preset_id,
                transition, job_status, parameters, created_at
            )
            SELECT $1, pb.prebuild_id, lb.build_number + 1, lb.template_version_id,
                   lb.preset_id, 'delete', 'pending', '[]'::jsonb, now()
            FROM prebuilds pb
            JOIN LATERAL (
                SELECT b.build_number, b.template_version_id, b.preset_id
                FROM prebuild_builds b
                WHERE b.prebuild_id = pb.prebuild_id
                ORDER BY b.build_number DESC
                LIMIT 1
            ) lb ON true
            WHERE pb.prebuild_id = $2
              AND pb.owner_id = $3
              AND NOT pb.deleted
            FOR UPDATE OF pb
            "#,
        )
        .bind(job_id.to_string())
        .bind(request.prebuild_id.to_string())
        .bind(UserId::PREBUILDS_OWNER.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let owner: Option<String> = sqlx::query_scalar(
                "SELECT owner_id FROM prebuilds WHERE prebuild_id = $1 AND NOT deleted",
            )
            .bind(request.prebuild_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

            return Err(match owner {
                Some(_) => ProvisionError::Claimed(request.prebuild_id),
                None => ProvisionError::NotFound(request.prebuild_id),
            });
        }

        info!(job_id = %job_id, "Queued prebuild delete build");
        Ok(job_id)
    }
}

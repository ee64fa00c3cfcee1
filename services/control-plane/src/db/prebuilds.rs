//! Postgres implementation of the prebuild store.
//!
//! Every query looks at the *latest* build of a workspace (highest
//! `build_number`) to decide what state it is in.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prewarm_id::{IdError, PrebuildId, PresetId, TemplateId, UserId};
use prewarm_reconcile::{
    BackoffRecord, InProgressCount, PrebuildSchedule, PresetRow, RunningPrebuild, Transition,
};
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, instrument};

use crate::prebuilds::{
    LockKey, PrebuildStore, SnapshotFacts, SnapshotQuery, StoreError, StoreResult,
};

/// Postgres-backed prebuild store.
#[derive(Debug, Clone)]
pub struct PgPrebuildStore {
    pool: PgPool,
}

impl PgPrebuildStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// A transaction-scoped advisory lock.
///
/// The lock lives as long as the transaction, and holds one pooled
/// connection while it does. [`PgAdvisoryLock::release`] rolls the
/// transaction back and returns once the lock is free. A guard that is only
/// dropped is rolled back when sqlx next uses the connection.
#[derive(Debug)]
pub struct PgAdvisoryLock {
    tx: Transaction<'static, Postgres>,
    key: LockKey,
}

impl PgAdvisoryLock {
    pub fn key(&self) -> LockKey {
        self.key
    }

    pub async fn release(self) -> Result<(), sqlx::Error> {
        debug!(key = %self.key, "Releasing advisory lock");
        self.tx.rollback().await
    }
}

const PRESETS_QUERY: &str = r#"
    SELECT
        p.preset_id,
        p.name,
        t.template_id,
        tv.template_version_id,
        p.desired_instances,
        p.invalidate_after_secs,
        p.scheduling_timezone,
        COALESCE(t.active_version_id = tv.template_version_id, false) AS using_active_version,
        t.deleted,
        t.deprecated
    FROM template_version_presets p
    JOIN template_versions tv ON tv.template_version_id = p.template_version_id
    JOIN templates t ON t.template_id = tv.template_id
    WHERE p.desired_instances IS NOT NULL
      AND ($1::TEXT IS NULL OR t.template_id = $1)
    ORDER BY t.template_id, p.preset_id
"#;

const SCHEDULES_QUERY: &str = r#"
    SELECT s.preset_id, s.cron_expression, s.desired_instances
    FROM template_version_preset_prebuild_schedules s
    JOIN template_version_presets p ON p.preset_id = s.preset_id
    JOIN template_versions tv ON tv.template_version_id = p.template_version_id
    WHERE p.desired_instances IS NOT NULL
      AND ($1::TEXT IS NULL OR tv.template_id = $1)
    ORDER BY s.preset_id, s.schedule_id
"#;

const RUNNING_QUERY: &str = r#"
    SELECT
        pb.prebuild_id,
        pb.name,
        pb.template_id,
        lb.template_version_id,
        lb.preset_id AS current_preset_id,
        lb.agents_ready AS ready,
        pb.created_at
    FROM prebuilds pb
    JOIN LATERAL (
        SELECT b.template_version_id, b.preset_id, b.transition, b.job_status, b.agents_ready
        FROM prebuild_builds b
        WHERE b.prebuild_id = pb.prebuild_id
        ORDER BY b.build_number DESC
        LIMIT 1
    ) lb ON true
    WHERE pb.owner_id = $1
      AND NOT pb.deleted
      AND lb.transition = 'start'
      AND lb.job_status = 'succeeded'
    ORDER BY pb.created_at, pb.prebuild_id
"#;

const IN_PROGRESS_QUERY: &str = r#"
    SELECT
        pb.template_id,
        lb.template_version_id,
        lb.preset_id,
        lb.transition,
        COUNT(*)::INT AS count
    FROM prebuilds pb
    JOIN LATERAL (
        SELECT b.template_version_id, b.preset_id, b.transition, b.job_status
        FROM prebuild_builds b
        WHERE b.prebuild_id = pb.prebuild_id
        ORDER BY b.build_number DESC
        LIMIT 1
    ) lb ON true
    WHERE pb.owner_id = $1
      AND lb.job_status IN ('pending', 'running')
    GROUP BY pb.template_id, lb.template_version_id, lb.preset_id, lb.transition
"#;

// Failed start builds since the preset's most recent success, within the
// lookback window.
const BACKOFF_QUERY: &str = r#"
    WITH recent AS (
        SELECT b.preset_id, b.job_status, b.created_at
        FROM prebuild_builds b
        JOIN prebuilds pb ON pb.prebuild_id = b.prebuild_id
        WHERE pb.owner_id = $1
          AND b.transition = 'start'
          AND b.preset_id IS NOT NULL
          AND b.job_status IN ('succeeded', 'failed')
          AND b.created_at >= now() - make_interval(secs => $2::FLOAT8)
    ),
    last_success AS (
        SELECT preset_id, MAX(created_at) AS succeeded_at
        FROM recent
        WHERE job_status = 'succeeded'
        GROUP BY preset_id
    )
    SELECT
        r.preset_id,
        COUNT(*)::INT AS num_failed,
        MAX(r.created_at) AS last_build_at
    FROM recent r
    LEFT JOIN last_success s ON s.preset_id = r.preset_id
    WHERE r.job_status = 'failed'
      AND (s.succeeded_at IS NULL OR r.created_at > s.succeeded_at)
    GROUP BY r.preset_id
"#;

const FAILURE_LIMIT_QUERY: &str = r#"
    WITH ranked AS (
        SELECT
            b.preset_id,
            b.job_status,
            ROW_NUMBER() OVER (PARTITION BY b.preset_id ORDER BY b.created_at DESC) AS rn
        FROM prebuild_builds b
        JOIN prebuilds pb ON pb.prebuild_id = b.prebuild_id
        WHERE pb.owner_id = $1
          AND b.transition = 'start'
          AND b.preset_id IS NOT NULL
          AND b.job_status IN ('succeeded', 'failed')
    )
    SELECT preset_id
    FROM ranked
    WHERE rn <= $2
    GROUP BY preset_id
    HAVING COUNT(*) = $2 AND bool_and(job_status = 'failed')
"#;

// Hands the oldest ready prebuild to the user. SKIP LOCKED lets concurrent
// claims for the same preset pick different rows instead of waiting.
const CLAIM_QUERY: &str = r#"
    UPDATE prebuilds
    SET owner_id = $1, name = $2, claimed_at = now()
    WHERE prebuild_id = (
        SELECT pb.prebuild_id
        FROM prebuilds pb
        JOIN LATERAL (
            SELECT b.preset_id, b.transition, b.job_status, b.agents_ready
            FROM prebuild_builds b
            WHERE b.prebuild_id = pb.prebuild_id
            ORDER BY b.build_number DESC
            LIMIT 1
        ) lb ON true
        WHERE pb.owner_id = $3
          AND NOT pb.deleted
          AND lb.preset_id = $4
          AND lb.transition = 'start'
          AND lb.job_status = 'succeeded'
          AND lb.agents_ready
        ORDER BY pb.created_at, pb.prebuild_id
        LIMIT 1
        FOR UPDATE OF pb SKIP LOCKED
    )
    RETURNING prebuild_id
"#;

fn decode_id<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = IdError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: IdError| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn decode_optional_id<T>(row: &PgRow, column: &str) -> Result<Option<T>, sqlx::Error>
where
    T: FromStr<Err = IdError>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| {
        s.parse().map_err(|e: IdError| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
    })
    .transpose()
}

/// Zero or negative means prebuilds never expire.
fn ttl_from_secs(secs: Option<i32>) -> Option<Duration> {
    secs.filter(|secs| *secs > 0)
        .and_then(|secs| u64::try_from(secs).ok())
        .map(Duration::from_secs)
}

struct PresetRecord(PresetRow);

impl<'r> sqlx::FromRow<'r, PgRow> for PresetRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let ttl_secs: Option<i32> = row.try_get("invalidate_after_secs")?;

        Ok(Self(PresetRow {
            preset_id: decode_id(row, "preset_id")?,
            name: row.try_get("name")?,
            template_id: decode_id(row, "template_id")?,
            template_version_id: decode_id(row, "template_version_id")?,
            desired_instances: row.try_get("desired_instances")?,
            using_active_version: row.try_get("using_active_version")?,
            deleted: row.try_get("deleted")?,
            deprecated: row.try_get("deprecated")?,
            ttl: ttl_from_secs(ttl_secs),
            scheduling_timezone: row.try_get("scheduling_timezone")?,
            schedules: Vec::new(),
        }))
    }
}

struct ScheduleRecord(PresetId, PrebuildSchedule);

impl<'r> sqlx::FromRow<'r, PgRow> for ScheduleRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self(
            decode_id(row, "preset_id")?,
            PrebuildSchedule {
                cron_expression: row.try_get("cron_expression")?,
                desired_instances: row.try_get("desired_instances")?,
            },
        ))
    }
}

struct RunningRecord(RunningPrebuild);

impl<'r> sqlx::FromRow<'r, PgRow> for RunningRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self(RunningPrebuild {
            id: decode_id(row, "prebuild_id")?,
            name: row.try_get("name")?,
            template_id: decode_id(row, "template_id")?,
            template_version_id: decode_id(row, "template_version_id")?,
            current_preset_id: decode_optional_id(row, "current_preset_id")?,
            ready: row.try_get("ready")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

struct InProgressRecord(InProgressCount);

impl<'r> sqlx::FromRow<'r, PgRow> for InProgressRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let transition: String = row.try_get("transition")?;
        let transition =
            transition
                .parse::<Transition>()
                .map_err(|e| sqlx::Error::ColumnDecode {
                    index: "transition".to_string(),
                    source: Box::new(e),
                })?;

        Ok(Self(InProgressCount {
            template_id: decode_id(row, "template_id")?,
            template_version_id: decode_id(row, "template_version_id")?,
            preset_id: decode_optional_id(row, "preset_id")?,
            transition,
            count: row.try_get("count")?,
        }))
    }
}

struct BackoffRow(BackoffRecord);

impl<'r> sqlx::FromRow<'r, PgRow> for BackoffRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let last_build_at: DateTime<Utc> = row.try_get("last_build_at")?;
        Ok(Self(BackoffRecord {
            preset_id: decode_id(row, "preset_id")?,
            num_failed: row.try_get("num_failed")?,
            last_build_at,
        }))
    }
}

async fn fetch_presets(
    conn: &mut PgConnection,
    template_id: Option<TemplateId>,
) -> StoreResult<Vec<PresetRow>> {
    let template_id = template_id.map(|id| id.to_string());
    let rows: Vec<PresetRecord> = sqlx::query_as(PRESETS_QUERY)
        .bind(template_id.as_deref())
        .fetch_all(&mut *conn)
        .await?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let schedules: Vec<ScheduleRecord> = sqlx::query_as(SCHEDULES_QUERY)
        .bind(template_id.as_deref())
        .fetch_all(&mut *conn)
        .await?;
    let mut by_preset: HashMap<PresetId, Vec<PrebuildSchedule>> = HashMap::new();
    for ScheduleRecord(preset_id, schedule) in schedules {
        by_preset.entry(preset_id).or_default().push(schedule);
    }

    Ok(rows
        .into_iter()
        .map(|PresetRecord(mut preset)| {
            preset.schedules = by_preset.remove(&preset.preset_id).unwrap_or_default();
            preset
        })
        .collect())
}

async fn fetch_running(conn: &mut PgConnection) -> StoreResult<Vec<RunningPrebuild>> {
    let rows: Vec<RunningRecord> = sqlx::query_as(RUNNING_QUERY)
        .bind(UserId::PREBUILDS_OWNER.to_string())
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

async fn fetch_in_progress(conn: &mut PgConnection) -> StoreResult<Vec<InProgressCount>> {
    let rows: Vec<InProgressRecord> = sqlx::query_as(IN_PROGRESS_QUERY)
        .bind(UserId::PREBUILDS_OWNER.to_string())
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

async fn fetch_backoffs(
    conn: &mut PgConnection,
    lookback: Duration,
) -> StoreResult<Vec<BackoffRecord>> {
    let rows: Vec<BackoffRow> = sqlx::query_as(BACKOFF_QUERY)
        .bind(UserId::PREBUILDS_OWNER.to_string())
        .bind(lookback.as_secs_f64())
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

async fn fetch_failure_limited(
    conn: &mut PgConnection,
    hard_limit: u32,
) -> StoreResult<Vec<PresetId>> {
    let rows: Vec<String> = sqlx::query_scalar(FAILURE_LIMIT_QUERY)
        .bind(UserId::PREBUILDS_OWNER.to_string())
        .bind(i64::from(hard_limit))
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|raw| {
            raw.parse::<PresetId>().map_err(|e| {
                StoreError::Database(sqlx::Error::ColumnDecode {
                    index: "preset_id".to_string(),
                    source: Box::new(e),
                })
            })
        })
        .collect()
}

#[async_trait]
impl PrebuildStore for PgPrebuildStore {
    type Lock = PgAdvisoryLock;

    #[instrument(skip(self))]
    async fn try_acquire_lock(&self, key: LockKey) -> StoreResult<Option<PgAdvisoryLock>> {
        let mut tx = self.pool.begin().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(key.value())
            .fetch_one(&mut *tx)
            .await?;

        if acquired {
            Ok(Some(PgAdvisoryLock { tx, key }))
        } else {
            tx.rollback().await?;
            Ok(None)
        }
    }

    async fn release_lock(&self, lock: PgAdvisoryLock) -> StoreResult<()> {
        lock.release().await?;
        Ok(())
    }

    async fn presets_with_prebuilds(
        &self,
        template_id: Option<TemplateId>,
    ) -> StoreResult<Vec<PresetRow>> {
        let mut conn = self.pool.acquire().await?;
        fetch_presets(&mut conn, template_id).await
    }

    async fn running_prebuilds(&self) -> StoreResult<Vec<RunningPrebuild>> {
        let mut conn = self.pool.acquire().await?;
        fetch_running(&mut conn).await
    }

    async fn count_in_progress(&self) -> StoreResult<Vec<InProgressCount>> {
        let mut conn = self.pool.acquire().await?;
        fetch_in_progress(&mut conn).await
    }

    async fn presets_backoff(&self, lookback: Duration) -> StoreResult<Vec<BackoffRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_backoffs(&mut conn, lookback).await
    }

    async fn presets_at_failure_limit(&self, hard_limit: u32) -> StoreResult<Vec<PresetId>> {
        let mut conn = self.pool.acquire().await?;
        fetch_failure_limited(&mut conn, hard_limit).await
    }

    /// Reads every fact inside one repeatable-read transaction so the
    /// snapshot is internally consistent.
    #[instrument(skip(self), fields(template_id = ?query.template_id))]
    async fn read_snapshot(&self, query: &SnapshotQuery) -> StoreResult<SnapshotFacts> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let presets = fetch_presets(&mut tx, query.template_id).await?;
        if presets.is_empty() {
            tx.commit().await?;
            return Ok(SnapshotFacts::default());
        }

        let running = fetch_running(&mut tx).await?;
        let in_progress = fetch_in_progress(&mut tx).await?;
        let backoffs = fetch_backoffs(&mut tx, query.backoff_lookback).await?;
        let hard_limited = if query.failure_hard_limit > 0 {
            fetch_failure_limited(&mut tx, query.failure_hard_limit).await?
        } else {
            Vec::new()
        };
        tx.commit().await?;

        debug!(
            presets = presets.len(),
            running = running.len(),
            in_progress = in_progress.len(),
            backoffs = backoffs.len(),
            hard_limited = hard_limited.len(),
            "Read prebuild snapshot"
        );

        Ok(SnapshotFacts {
            presets,
            running,
            in_progress,
            backoffs,
            hard_limited,
        })
    }

    #[instrument(skip(self, name))]
    async fn claim_prebuild(
        &self,
        user_id: UserId,
        name: &str,
        preset_id: PresetId,
    ) -> StoreResult<Option<PrebuildId>> {
        let claimed: Option<String> = sqlx::query_scalar(CLAIM_QUERY)
            .bind(user_id.to_string())
            .bind(name)
            .bind(UserId::PREBUILDS_OWNER.to_string())
            .bind(preset_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        claimed
            .map(|raw| {
                raw.parse::<PrebuildId>().map_err(|e| {
                    StoreError::Database(sqlx::Error::ColumnDecode {
                        index: "prebuild_id".to_string(),
                        source: Box::new(e),
                    })
                })
            })
            .transpose()
    }
}

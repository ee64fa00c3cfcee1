//! The store surface the reconciler and claimer depend on.

use std::time::Duration;

use async_trait::async_trait;
use prewarm_id::{PrebuildId, PresetId, TemplateId, UserId};
use prewarm_reconcile::{BackoffRecord, InProgressCount, PresetRow, RunningPrebuild};
use thiserror::Error;

use super::locks::LockKey;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Parameters for reading a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotQuery {
    /// Restrict presets to one template; `None` reads all templates.
    pub template_id: Option<TemplateId>,
    pub backoff_lookback: Duration,
    /// Zero disables the hard-limit query.
    pub failure_hard_limit: u32,
}

/// Raw facts from which a snapshot is assembled.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFacts {
    pub presets: Vec<PresetRow>,
    pub running: Vec<RunningPrebuild>,
    pub in_progress: Vec<InProgressCount>,
    pub backoffs: Vec<BackoffRecord>,
    pub hard_limited: Vec<PresetId>,
}

#[async_trait]
pub trait PrebuildStore: Send + Sync + 'static {
    /// Guard for a held advisory lock. Dropping it also releases the lock,
    /// though possibly some time later.
    type Lock: Send + 'static;

    /// Takes the lock without waiting. `None` means another holder has it.
    async fn try_acquire_lock(&self, key: LockKey) -> StoreResult<Option<Self::Lock>>;

    /// Releases a held lock and waits until it is free for other holders.
    async fn release_lock(&self, lock: Self::Lock) -> StoreResult<()> {
        drop(lock);
        Ok(())
    }

    async fn presets_with_prebuilds(
        &self,
        template_id: Option<TemplateId>,
    ) -> StoreResult<Vec<PresetRow>>;

    async fn running_prebuilds(&self) -> StoreResult<Vec<RunningPrebuild>>;

    async fn count_in_progress(&self) -> StoreResult<Vec<InProgressCount>>;

    /// Consecutive failures per preset within `lookback`.
    async fn presets_backoff(&self, lookback: Duration) -> StoreResult<Vec<BackoffRecord>>;

    /// Presets whose last `hard_limit` builds all failed.
    async fn presets_at_failure_limit(&self, hard_limit: u32) -> StoreResult<Vec<PresetId>>;

    /// Reads every fact for one pass. Implementations that can should read
    /// them from a single consistent view.
    async fn read_snapshot(&self, query: &SnapshotQuery) -> StoreResult<SnapshotFacts> {
        let presets = self.presets_with_prebuilds(query.template_id).await?;
        if presets.is_empty() {
            return Ok(SnapshotFacts::default());
        }

        let running = self.running_prebuilds().await?;
        let in_progress = self.count_in_progress().await?;
        let backoffs = self.presets_backoff(query.backoff_lookback).await?;
        let hard_limited = if query.failure_hard_limit > 0 {
            self.presets_at_failure_limit(query.failure_hard_limit)
                .await?
        } else {
            Vec::new()
        };

        Ok(SnapshotFacts {
            presets,
            running,
            in_progress,
            backoffs,
            hard_limited,
        })
    }

    /// Atomically hands one ready prebuild of `preset_id` to `user_id`,
    /// renaming it to `name`. Returns `None` when nothing is claimable.
    async fn claim_prebuild(
        &self,
        user_id: UserId,
        name: &str,
        preset_id: PresetId,
    ) -> StoreResult<Option<PrebuildId>>;
}

//! In-memory store and provisioner.
//!
//! These back the reconciler in tests and local experiments. The store keeps
//! the facts a snapshot is built from; the provisioner records requests and
//! can optionally materialize them as running prebuilds.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use prewarm_id::{BuildJobId, PrebuildId, PresetId, TemplateId, UserId};
use prewarm_reconcile::{BackoffRecord, Clock, InProgressCount, PresetRow, RunningPrebuild};

use super::locks::LockKey;
use super::provisioner::{DeleteRequest, PrebuildRequest, ProvisionError, Provisioner};
use super::store::{PrebuildStore, StoreError, StoreResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct StoredPrebuild {
    prebuild: RunningPrebuild,
    owner: UserId,
}

#[derive(Debug, Default)]
struct StoreState {
    presets: Vec<PresetRow>,
    prebuilds: Vec<StoredPrebuild>,
    in_progress: Vec<InProgressCount>,
    backoffs: Vec<BackoffRecord>,
    hard_limited: Vec<PresetId>,
    fail_reads: bool,
    snapshot_reads: usize,
    lock_releases: usize,
}

type LockSet = Arc<Mutex<HashSet<LockKey>>>;

/// Advisory lock held in a [`MemoryPrebuildStore`]; released on drop.
#[derive(Debug)]
pub struct MemoryLock {
    key: LockKey,
    locks: LockSet,
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        lock(&self.locks).remove(&self.key);
    }
}

#[derive(Debug, Default)]
pub struct MemoryPrebuildStore {
    state: Mutex<StoreState>,
    locks: LockSet,
}

impl MemoryPrebuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a preset, replacing any with the same ID.
    pub fn upsert_preset(&self, preset: PresetRow) {
        let mut state = lock(&self.state);
        state.presets.retain(|p| p.preset_id != preset.preset_id);
        state.presets.push(preset);
    }

    /// Adds a running prebuild owned by the prebuilds owner.
    pub fn insert_running(&self, prebuild: RunningPrebuild) {
        lock(&self.state).prebuilds.push(StoredPrebuild {
            prebuild,
            owner: UserId::PREBUILDS_OWNER,
        });
    }

    pub fn remove_prebuild(&self, prebuild_id: PrebuildId) -> bool {
        let mut state = lock(&self.state);
        let before = state.prebuilds.len();
        state.prebuilds.retain(|p| p.prebuild.id != prebuild_id);
        state.prebuilds.len() != before
    }

    pub fn set_in_progress(&self, in_progress: Vec<InProgressCount>) {
        lock(&self.state).in_progress = in_progress;
    }

    pub fn set_backoffs(&self, backoffs: Vec<BackoffRecord>) {
        lock(&self.state).backoffs = backoffs;
    }

    pub fn set_hard_limited(&self, presets: Vec<PresetId>) {
        lock(&self.state).hard_limited = presets;
    }

    /// Makes every read fail with [`StoreError::Unavailable`].
    pub fn set_fail_reads(&self, fail: bool) {
        lock(&self.state).fail_reads = fail;
    }

    /// Takes an advisory lock as if held by another replica.
    pub fn hold_lock(&self, key: LockKey) -> Option<MemoryLock> {
        self.acquire(key)
    }

    pub fn is_locked(&self, key: LockKey) -> bool {
        lock(&self.locks).contains(&key)
    }

    /// Running prebuilds of a preset still owned by the prebuilds owner.
    pub fn running_for_preset(&self, preset_id: PresetId) -> Vec<RunningPrebuild> {
        lock(&self.state)
            .prebuilds
            .iter()
            .filter(|p| p.owner.is_prebuilds_owner())
            .filter(|p| p.prebuild.current_preset_id == Some(preset_id))
            .map(|p| p.prebuild.clone())
            .collect()
    }

    pub fn owner_of(&self, prebuild_id: PrebuildId) -> Option<UserId> {
        lock(&self.state)
            .prebuilds
            .iter()
            .find(|p| p.prebuild.id == prebuild_id)
            .map(|p| p.owner)
    }

    /// Number of snapshot reads served.
    pub fn snapshot_reads(&self) -> usize {
        lock(&self.state).snapshot_reads
    }

    /// Number of locks handed back through `release_lock`.
    pub fn lock_releases(&self) -> usize {
        lock(&self.state).lock_releases
    }

    fn acquire(&self, key: LockKey) -> Option<MemoryLock> {
        let mut locks = lock(&self.locks);
        if !locks.insert(key) {
            return None;
        }
        Some(MemoryLock {
            key,
            locks: Arc::clone(&self.locks),
        })
    }

    fn read_state(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        let state = lock(&self.state);
        if state.fail_reads {
            return Err(StoreError::Unavailable("reads disabled".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl PrebuildStore for MemoryPrebuildStore {
    type Lock = MemoryLock;

    async fn try_acquire_lock(&self, key: LockKey) -> StoreResult<Option<MemoryLock>> {
        Ok(self.acquire(key))
    }

    async fn release_lock(&self, held: MemoryLock) -> StoreResult<()> {
        drop(held);
        lock(&self.state).lock_releases += 1;
        Ok(())
    }

    async fn presets_with_prebuilds(
        &self,
        template_id: Option<TemplateId>,
    ) -> StoreResult<Vec<PresetRow>> {
        let mut state = self.read_state()?;
        state.snapshot_reads += 1;
        Ok(state
            .presets
            .iter()
            .filter(|p| p.desired_instances.is_some())
            .filter(|p| template_id.is_none_or(|id| p.template_id == id))
            .cloned()
            .collect())
    }

    async fn running_prebuilds(&self) -> StoreResult<Vec<RunningPrebuild>> {
        Ok(self
            .read_state()?
            .prebuilds
            .iter()
            .filter(|p| p.owner.is_prebuilds_owner())
            .map(|p| p.prebuild.clone())
            .collect())
    }

    async fn count_in_progress(&self) -> StoreResult<Vec<InProgressCount>> {
        Ok(self.read_state()?.in_progress.clone())
    }

    async fn presets_backoff(&self, _lookback: Duration) -> StoreResult<Vec<BackoffRecord>> {
        Ok(self.read_state()?.backoffs.clone())
    }

    async fn presets_at_failure_limit(&self, _hard_limit: u32) -> StoreResult<Vec<PresetId>> {
        Ok(self.read_state()?.hard_limited.clone())
    }

    async fn claim_prebuild(
        &self,
        user_id: UserId,
        name: &str,
        preset_id: PresetId,
    ) -> StoreResult<Option<PrebuildId>> {
        let mut state = self.read_state()?;
        let candidate = state
            .prebuilds
            .iter_mut()
            .filter(|p| p.owner.is_prebuilds_owner())
            .filter(|p| p.prebuild.ready && p.prebuild.current_preset_id == Some(preset_id))
            .min_by_key(|p| (p.prebuild.created_at, p.prebuild.id));

        Ok(candidate.map(|p| {
            p.owner = user_id;
            p.prebuild.name = name.to_string();
            p.prebuild.id
        }))
    }
}

#[derive(Debug, Default)]
struct ProvisionerState {
    created: Vec<PrebuildRequest>,
    deleted: Vec<DeleteRequest>,
    fail_creates: bool,
}

/// Provisioner that records requests.
///
/// When built with [`MemoryProvisioner::backed_by`] it also applies them to a
/// [`MemoryPrebuildStore`]: creates become ready running prebuilds and
/// deletes remove them, as if every build finished instantly.
#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    backing: Option<(Arc<MemoryPrebuildStore>, Arc<dyn Clock>)>,
    state: Mutex<ProvisionerState>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backed_by(store: Arc<MemoryPrebuildStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backing: Some((store, clock)),
            state: Mutex::default(),
        }
    }

    /// Makes every create request fail.
    pub fn set_fail_creates(&self, fail: bool) {
        lock(&self.state).fail_creates = fail;
    }

    pub fn created(&self) -> Vec<PrebuildRequest> {
        lock(&self.state).created.clone()
    }

    pub fn deleted(&self) -> Vec<DeleteRequest> {
        lock(&self.state).deleted.clone()
    }
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    async fn create_prebuild(&self, request: &PrebuildRequest) -> Result<BuildJobId, ProvisionError> {
        {
            let mut state = lock(&self.state);
            if state.fail_creates {
                return Err(ProvisionError::Rejected("creates disabled".to_string()));
            }
            state.created.push(request.clone());
        }

        if let Some((store, clock)) = &self.backing {
            store.insert_running(RunningPrebuild {
                id: request.prebuild_id,
                name: request.name.clone(),
                template_id: request.template_id,
                template_version_id: request.template_version_id,
                current_preset_id: Some(request.preset_id),
                ready: true,
                created_at: clock.now(),
            });
        }

        Ok(BuildJobId::new())
    }

    async fn delete_prebuild(&self, request: &DeleteRequest) -> Result<BuildJobId, ProvisionError> {
        if let Some((store, _)) = &self.backing {
            match store.owner_of(request.prebuild_id) {
                None => return Err(ProvisionError::NotFound(request.prebuild_id)),
                Some(owner) if !owner.is_prebuilds_owner() => {
                    return Err(ProvisionError::Claimed(request.prebuild_id))
                }
                Some(_) => {
                    store.remove_prebuild(request.prebuild_id);
                }
            }
        }

        lock(&self.state).deleted.push(request.clone());
        Ok(BuildJobId::new())
    }
}

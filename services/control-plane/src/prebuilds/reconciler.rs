//! Prebuild reconciler.
//!
//! One pass:
//! - Takes the global advisory lock (another replica holding it ends the pass)
//! - Reads a consistent snapshot of presets and their prebuilds
//! - Reconciles templates concurrently, each under its own advisory lock
//! - Reconciles the presets of a template concurrently and applies the
//!   resulting create/delete actions through the provisioner
//!
//! A failing preset or template is logged and counted; it never aborts its
//! siblings.

use std::sync::Arc;
use std::time::Duration;

use prewarm_id::{PresetId, TemplateId};
use prewarm_reconcile::{Clock, GlobalSnapshot, PresetSnapshot, ReconciliationActions};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::locks::LockKey;
use super::provisioner::{DeleteRequest, PrebuildRequest, Provisioner};
use super::snapshot_reader::SnapshotReader;
use super::store::{PrebuildStore, StoreError};
use crate::config::PrebuildsConfig;

/// Errors that end a reconciliation pass.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("reconciliation cancelled")]
    Cancelled,
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Another replica held the global lock; nothing was done.
    pub lock_contended: bool,
    pub templates_processed: u32,
    /// Templates whose lock was held elsewhere.
    pub templates_skipped: u32,
    pub templates_failed: u32,
    pub presets_processed: u32,
    /// Inactive presets with nothing left to clean up.
    pub presets_skipped: u32,
    pub presets_hard_limited: u32,
    pub presets_backed_off: u32,
    pub presets_failed: u32,
    pub prebuilds_created: u32,
    pub prebuilds_deleted: u32,
    pub provision_failures: u32,
}

impl ReconcileStats {
    fn merge(&mut self, other: &Self) {
        self.lock_contended |= other.lock_contended;
        self.templates_processed += other.templates_processed;
        self.templates_skipped += other.templates_skipped;
        self.templates_failed += other.templates_failed;
        self.presets_processed += other.presets_processed;
        self.presets_skipped += other.presets_skipped;
        self.presets_hard_limited += other.presets_hard_limited;
        self.presets_backed_off += other.presets_backed_off;
        self.presets_failed += other.presets_failed;
        self.prebuilds_created += other.prebuilds_created;
        self.prebuilds_deleted += other.prebuilds_deleted;
        self.provision_failures += other.provision_failures;
    }

    /// True when the pass issued or attempted any provisioning request.
    pub fn has_changes(&self) -> bool {
        self.prebuilds_created > 0 || self.prebuilds_deleted > 0 || self.provision_failures > 0
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Drives presets toward their desired prebuild count.
pub struct Reconciler<S, P> {
    store: Arc<S>,
    provisioner: Arc<P>,
    reader: SnapshotReader<S>,
    backoff_interval: Duration,
    template_permits: Arc<Semaphore>,
}

impl<S, P> Clone for Reconciler<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            provisioner: Arc::clone(&self.provisioner),
            reader: self.reader.clone(),
            backoff_interval: self.backoff_interval,
            template_permits: Arc::clone(&self.template_permits),
        }
    }
}

impl<S: PrebuildStore, P: Provisioner> Reconciler<S, P> {
    pub fn new(
        store: Arc<S>,
        provisioner: Arc<P>,
        clock: Arc<dyn Clock>,
        config: &PrebuildsConfig,
    ) -> Self {
        let reader = SnapshotReader::new(
            Arc::clone(&store),
            clock,
            config.backoff_lookback,
            config.failure_hard_limit,
        );

        Self {
            store,
            provisioner,
            reader,
            backoff_interval: config.backoff_interval,
            template_permits: Arc::new(Semaphore::new(config.max_concurrent_templates.max(1))),
        }
    }

    /// Runs a pass over every template that has prebuilds configured.
    #[instrument(skip(self, cancel))]
    pub async fn reconcile_all(
        &self,
        cancel: watch::Receiver<bool>,
    ) -> Result<ReconcileStats, ReconcileError> {
        self.reconcile(cancel, None).await
    }

    /// Runs a pass over a single template.
    #[instrument(skip(self, cancel))]
    pub async fn reconcile_template(
        &self,
        cancel: watch::Receiver<bool>,
        template_id: TemplateId,
    ) -> Result<ReconcileStats, ReconcileError> {
        self.reconcile(cancel, Some(template_id)).await
    }

    async fn reconcile(
        &self,
        cancel: watch::Receiver<bool>,
        scope: Option<TemplateId>,
    ) -> Result<ReconcileStats, ReconcileError> {
        if is_cancelled(&cancel) {
            return Err(ReconcileError::Cancelled);
        }

        let Some(lock) = self.store.try_acquire_lock(LockKey::RECONCILE_ALL).await? else {
            debug!("Reconciliation lock held by another replica, skipping pass");
            return Ok(ReconcileStats {
                lock_contended: true,
                ..Default::default()
            });
        };

        let result = self.run_pass(cancel, scope).await;
        self.release(lock, LockKey::RECONCILE_ALL).await;
        result
    }

    async fn release(&self, lock: S::Lock, key: LockKey) {
        if let Err(e) = self.store.release_lock(lock).await {
            warn!(key = %key, error = %e, "Failed to release advisory lock");
        }
    }

    async fn run_pass(
        &self,
        cancel: watch::Receiver<bool>,
        scope: Option<TemplateId>,
    ) -> Result<ReconcileStats, ReconcileError> {
        let snapshot = Arc::new(self.reader.read(scope).await?);
        if snapshot.is_empty() {
            debug!("No presets with prebuilds configured");
            return Ok(ReconcileStats::default());
        }

        let mut templates = JoinSet::new();
        for template_id in snapshot.template_ids() {
            let this = self.clone();
            let snapshot = Arc::clone(&snapshot);
            let cancel = cancel.clone();
            templates.spawn(async move {
                let _permit = match Arc::clone(&this.template_permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (template_id, Err(ReconcileError::Cancelled)),
                };
                let result = this.reconcile_presets(template_id, &snapshot, cancel).await;
                (template_id, result)
            });
        }

        let mut stats = ReconcileStats::default();
        while let Some(joined) = templates.join_next().await {
            match joined {
                Ok((_, Ok(template_stats))) => stats.merge(&template_stats),
                Ok((_, Err(ReconcileError::Cancelled))) => {}
                Ok((template_id, Err(e))) => {
                    error!(template_id = %template_id, error = %e, "Failed to reconcile template");
                    stats.templates_failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Template reconciliation task panicked");
                    stats.templates_failed += 1;
                }
            }
        }

        if is_cancelled(&cancel) {
            return Err(ReconcileError::Cancelled);
        }

        if stats.has_changes() || stats.templates_failed > 0 || stats.presets_failed > 0 {
            info!(
                templates_processed = stats.templates_processed,
                templates_failed = stats.templates_failed,
                presets_processed = stats.presets_processed,
                presets_failed = stats.presets_failed,
                prebuilds_created = stats.prebuilds_created,
                prebuilds_deleted = stats.prebuilds_deleted,
                provision_failures = stats.provision_failures,
                "Prebuild reconciliation pass complete"
            );
        } else {
            debug!(
                templates_processed = stats.templates_processed,
                presets_processed = stats.presets_processed,
                "Prebuild reconciliation pass complete, no changes"
            );
        }

        Ok(stats)
    }

    async fn reconcile_presets(
        &self,
        template_id: TemplateId,
        snapshot: &GlobalSnapshot,
        cancel: watch::Receiver<bool>,
    ) -> Result<ReconcileStats, ReconcileError> {
        let key = LockKey::for_template(template_id);
        let Some(lock) = self.store.try_acquire_lock(key).await? else {
            debug!(template_id = %template_id, "Template lock held elsewhere, skipping template");
            return Ok(ReconcileStats {
                templates_skipped: 1,
                ..Default::default()
            });
        };

        let result = self.run_template(template_id, snapshot, cancel).await;
        self.release(lock, key).await;
        result
    }

    async fn run_template(
        &self,
        template_id: TemplateId,
        snapshot: &GlobalSnapshot,
        cancel: watch::Receiver<bool>,
    ) -> Result<ReconcileStats, ReconcileError> {
        let mut stats = ReconcileStats {
            templates_processed: 1,
            ..Default::default()
        };

        let preset_ids: Vec<PresetId> = snapshot
            .presets_for_template(template_id)
            .map(|p| p.preset_id)
            .collect();

        let mut presets = JoinSet::new();
        for preset_id in preset_ids {
            let preset = match snapshot.filter_by_preset(preset_id) {
                Ok(preset) => preset,
                Err(e) => {
                    warn!(preset_id = %preset_id, error = %e, "Failed to narrow snapshot to preset");
                    stats.presets_failed += 1;
                    continue;
                }
            };

            if preset.is_hard_limited {
                warn!(
                    template_id = %template_id,
                    preset_id = %preset_id,
                    preset = %preset.preset.name,
                    "Preset reached the failure hard limit, skipping"
                );
                stats.presets_hard_limited += 1;
                continue;
            }

            if preset.can_skip_reconciliation() {
                stats.presets_skipped += 1;
                continue;
            }

            let this = self.clone();
            let cancel = cancel.clone();
            presets.spawn(async move { this.reconcile_preset(preset, cancel).await });
        }

        let mut cancelled = false;
        while let Some(joined) = presets.join_next().await {
            match joined {
                Ok(Ok(preset_stats)) => stats.merge(&preset_stats),
                Ok(Err(ReconcileError::Cancelled)) => cancelled = true,
                Ok(Err(e)) => {
                    error!(template_id = %template_id, error = %e, "Failed to reconcile preset");
                    stats.presets_failed += 1;
                }
                Err(e) => {
                    error!(template_id = %template_id, error = %e, "Preset reconciliation task panicked");
                    stats.presets_failed += 1;
                }
            }
        }

        if cancelled {
            return Err(ReconcileError::Cancelled);
        }
        Ok(stats)
    }

    async fn reconcile_preset(
        &self,
        preset: PresetSnapshot,
        cancel: watch::Receiver<bool>,
    ) -> Result<ReconcileStats, ReconcileError> {
        let mut stats = ReconcileStats {
            presets_processed: 1,
            ..Default::default()
        };

        if let Err(e) = preset.active_schedule() {
            warn!(
                preset_id = %preset.preset_id(),
                preset = %preset.preset.name,
                error = %e,
                "Invalid prebuild schedule, using the default desired instances"
            );
        }

        let state = preset.calculate_state();
        let actions = preset.calculate_actions(self.backoff_interval);

        match &actions {
            ReconciliationActions::Backoff { until } => {
                warn!(
                    preset_id = %preset.preset_id(),
                    preset = %preset.preset.name,
                    backoff_until = %until,
                    failed_builds = preset.backoff.as_ref().map_or(0, |b| b.num_failed),
                    "Preset is backing off after failed builds"
                );
                stats.presets_backed_off = 1;
                return Ok(stats);
            }
            actions if actions.is_noop() => {
                debug!(
                    preset_id = %preset.preset_id(),
                    status = %preset.status,
                    actual = state.actual,
                    desired = state.desired,
                    starting = state.starting,
                    "Preset is up to date"
                );
                return Ok(stats);
            }
            actions => {
                info!(
                    template_id = %preset.template_id(),
                    preset_id = %preset.preset_id(),
                    preset = %preset.preset.name,
                    status = %preset.status,
                    action = %actions.action_type(),
                    actual = state.actual,
                    expired = state.expired,
                    desired = state.desired,
                    extraneous = state.extraneous,
                    starting = state.starting,
                    deleting = state.deleting,
                    "Reconciling preset"
                );
            }
        }

        self.apply(&preset, actions, &mut stats, &cancel).await?;
        Ok(stats)
    }

    async fn apply(
        &self,
        preset: &PresetSnapshot,
        actions: ReconciliationActions,
        stats: &mut ReconcileStats,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), ReconcileError> {
        match actions {
            ReconciliationActions::Create { count } => {
                for _ in 0..count {
                    if is_cancelled(cancel) {
                        return Err(ReconcileError::Cancelled);
                    }

                    let request = PrebuildRequest::for_preset(&preset.preset);
                    match self.provisioner.create_prebuild(&request).await {
                        Ok(job_id) => {
                            debug!(
                                prebuild_id = %request.prebuild_id,
                                name = %request.name,
                                job_id = %job_id,
                                "Requested prebuild"
                            );
                            stats.prebuilds_created += 1;
                        }
                        Err(e) => {
                            error!(
                                preset_id = %preset.preset_id(),
                                error = %e,
                                "Failed to create prebuild"
                            );
                            stats.provision_failures += 1;
                        }
                    }
                }
            }
            ReconciliationActions::Delete { ids } => {
                for prebuild_id in ids {
                    if is_cancelled(cancel) {
                        return Err(ReconcileError::Cancelled);
                    }

                    let request = DeleteRequest {
                        prebuild_id,
                        template_id: preset.template_id(),
                        preset_id: preset.preset_id(),
                    };
                    match self.provisioner.delete_prebuild(&request).await {
                        Ok(job_id) => {
                            debug!(prebuild_id = %prebuild_id, job_id = %job_id, "Requested prebuild deletion");
                            stats.prebuilds_deleted += 1;
                        }
                        Err(e) => {
                            error!(
                                preset_id = %preset.preset_id(),
                                prebuild_id = %prebuild_id,
                                error = %e,
                                "Failed to delete prebuild"
                            );
                            stats.provision_failures += 1;
                        }
                    }
                }
            }
            ReconciliationActions::Backoff { .. } => {}
        }

        Ok(())
    }
}

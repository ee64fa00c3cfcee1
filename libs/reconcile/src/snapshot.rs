//! Point-in-time views over prebuild state.
//!
//! A [`GlobalSnapshot`] is assembled once per reconciliation pass from the
//! store's facts and is never mutated afterwards. [`GlobalSnapshot::filter_by_preset`]
//! narrows it to the [`PresetSnapshot`] the decision logic works on.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use prewarm_id::{PresetId, TemplateId};

use crate::clock::Clock;
use crate::error::{ScheduleError, SnapshotError};
use crate::model::{
    BackoffRecord, InProgressCount, PrebuildSchedule, PresetRow, PresetStatus, RunningPrebuild,
};
use crate::schedule;

/// Every fact needed to reconcile all presets, captured at one instant.
#[derive(Debug, Clone)]
pub struct GlobalSnapshot {
    presets: Vec<PresetRow>,
    running: Vec<RunningPrebuild>,
    in_progress: Vec<InProgressCount>,
    backoffs: HashMap<PresetId, BackoffRecord>,
    hard_limited: HashSet<PresetId>,
    now: DateTime<Utc>,
}

impl GlobalSnapshot {
    /// Reads `clock` once; expiry, backoff and schedules are all judged
    /// against that instant.
    pub fn new(
        presets: Vec<PresetRow>,
        running: Vec<RunningPrebuild>,
        in_progress: Vec<InProgressCount>,
        backoffs: Vec<BackoffRecord>,
        hard_limited: Vec<PresetId>,
        clock: &dyn Clock,
    ) -> Self {
        Self {
            presets,
            running,
            in_progress,
            backoffs: backoffs
                .into_iter()
                .map(|record| (record.preset_id, record))
                .collect(),
            hard_limited: hard_limited.into_iter().collect(),
            now: clock.now(),
        }
    }

    /// The instant every decision made from this snapshot is taken at.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn presets(&self) -> &[PresetRow] {
        &self.presets
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    /// Distinct template IDs, in ID order.
    pub fn template_ids(&self) -> Vec<TemplateId> {
        self.presets
            .iter()
            .map(|p| p.template_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn presets_for_template(
        &self,
        template_id: TemplateId,
    ) -> impl Iterator<Item = &PresetRow> + '_ {
        self.presets
            .iter()
            .filter(move |p| p.template_id == template_id)
    }

    /// Narrows the snapshot to a single preset.
    pub fn filter_by_preset(&self, preset_id: PresetId) -> Result<PresetSnapshot, SnapshotError> {
        let preset = self
            .presets
            .iter()
            .find(|p| p.preset_id == preset_id)
            .cloned()
            .ok_or(SnapshotError::PresetNotFound(preset_id))?;

        let now = self.now;
        let (running, expired): (Vec<_>, Vec<_>) = self
            .running
            .iter()
            .filter(|prebuild| prebuild.current_preset_id == Some(preset_id))
            .cloned()
            .partition(|prebuild| !is_expired(&preset, prebuild, now));

        let in_progress = self
            .in_progress
            .iter()
            .filter(|row| row.preset_id == Some(preset_id))
            .cloned()
            .collect();

        Ok(PresetSnapshot {
            status: preset.status(),
            backoff: self.backoffs.get(&preset_id).cloned(),
            is_hard_limited: self.hard_limited.contains(&preset_id),
            preset,
            running,
            expired,
            in_progress,
            now,
        })
    }
}

fn is_expired(preset: &PresetRow, prebuild: &RunningPrebuild, now: DateTime<Utc>) -> bool {
    let Some(ttl) = preset.ttl.filter(|ttl| !ttl.is_zero()) else {
        return false;
    };
    // A TTL too large for chrono never elapses.
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return false;
    };
    now.signed_duration_since(prebuild.created_at) > ttl
}

/// The slice of a [`GlobalSnapshot`] that concerns one preset.
#[derive(Debug, Clone)]
pub struct PresetSnapshot {
    pub preset: PresetRow,
    pub status: PresetStatus,
    /// Running prebuilds within their TTL.
    pub running: Vec<RunningPrebuild>,
    /// Running prebuilds past their TTL.
    pub expired: Vec<RunningPrebuild>,
    pub in_progress: Vec<InProgressCount>,
    pub backoff: Option<BackoffRecord>,
    /// Informational; callers decide what a hard limit means.
    pub is_hard_limited: bool,
    /// Taken once when the global snapshot was built.
    pub(crate) now: DateTime<Utc>,
}

impl PresetSnapshot {
    pub fn preset_id(&self) -> PresetId {
        self.preset.preset_id
    }

    pub fn template_id(&self) -> TemplateId {
        self.preset.template_id
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// The schedule in force at the snapshot's instant, if any.
    pub fn active_schedule(&self) -> Result<Option<&PrebuildSchedule>, ScheduleError> {
        schedule::active_schedule(
            &self.preset.scheduling_timezone,
            &self.preset.schedules,
            self.now,
        )
    }

    /// How many prebuilds the preset wants right now: the active schedule's
    /// count, or `desired_instances` when no schedule applies or the
    /// scheduling configuration is invalid.
    pub fn desired_instances(&self) -> i32 {
        let desired = match self.active_schedule() {
            Ok(Some(schedule)) => schedule.desired_instances,
            Ok(None) | Err(_) => self.preset.desired_instances.unwrap_or(0),
        };
        desired.max(0)
    }

    /// An inactive preset with nothing running and nothing in flight has no
    /// work to do, so callers need not spend a task on it.
    pub fn can_skip_reconciliation(&self) -> bool {
        !self.is_active()
            && self.running.is_empty()
            && self.expired.is_empty()
            && self.in_progress.iter().all(|row| row.count <= 0)
    }
}

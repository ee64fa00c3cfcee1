//! Diffing desired against actual state and choosing the next step.
//!
//! Both calculations are pure functions of a [`PresetSnapshot`]; calling them
//! repeatedly on the same snapshot yields the same answer.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prewarm_id::PrebuildId;

use crate::model::{RunningPrebuild, Transition};
use crate::snapshot::PresetSnapshot;

/// Derived counts for one preset. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconciliationState {
    /// Running prebuilds within their TTL (zero for inactive presets).
    pub actual: i32,
    /// Running prebuilds past their TTL.
    pub expired: i32,
    pub desired: i32,
    /// Ready prebuilds that can satisfy a claim.
    pub eligible: i32,
    /// Running prebuilds beyond the desired count.
    pub extraneous: i32,
    pub starting: i32,
    pub stopping: i32,
    pub deleting: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Create,
    Delete,
    Backoff,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Backoff => "backoff",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single step that moves a preset closer to its desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationActions {
    /// Provision this many new prebuilds. Zero means nothing to do.
    Create { count: i32 },
    /// Delete these prebuilds, oldest first.
    Delete { ids: Vec<PrebuildId> },
    /// Do nothing until the given instant.
    Backoff { until: DateTime<Utc> },
}

impl ReconciliationActions {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::Create { .. } => ActionType::Create,
            Self::Delete { .. } => ActionType::Delete,
            Self::Backoff { .. } => ActionType::Backoff,
        }
    }

    /// True when applying the action would issue no requests and the preset
    /// is not being held back.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Create { count } => *count <= 0,
            Self::Delete { ids } => ids.is_empty(),
            Self::Backoff { .. } => false,
        }
    }
}

impl PresetSnapshot {
    /// Counts the preset's prebuilds against its configuration.
    pub fn calculate_state(&self) -> ReconciliationState {
        let (starting, stopping, deleting) = self.count_in_progress();
        let expired = len_i32(self.expired.len());

        if !self.is_active() {
            return ReconciliationState {
                expired,
                starting,
                stopping,
                deleting,
                ..ReconciliationState::default()
            };
        }

        let actual = len_i32(self.running.len());
        let desired = self.desired_instances();
        let eligible = len_i32(self.running.iter().filter(|p| p.ready).count());

        ReconciliationState {
            actual,
            expired,
            desired,
            eligible,
            extraneous: (actual - desired).max(0),
            starting,
            stopping,
            deleting,
        }
    }

    /// Decides what to do this pass. Rules are tried in order and the first
    /// that applies wins:
    ///
    /// 1. recent failures put the preset in backoff;
    /// 2. inactive presets scale to zero;
    /// 3. expired and excess prebuilds are deleted;
    /// 4. missing prebuilds are created.
    pub fn calculate_actions(&self, backoff_interval: Duration) -> ReconciliationActions {
        if let Some(until) = self.backoff_until(backoff_interval) {
            if self.now() <= until {
                return ReconciliationActions::Backoff { until };
            }
        }

        if !self.is_active() {
            return self.scale_to_zero();
        }

        let state = self.calculate_state();

        if state.extraneous > 0 || !self.expired.is_empty() {
            let extraneous = usize::try_from(state.extraneous).unwrap_or(0);
            let mut ids: Vec<PrebuildId> =
                oldest_first(&self.expired).into_iter().map(|p| p.id).collect();
            ids.extend(
                oldest_first(&self.running)
                    .into_iter()
                    .take(extraneous)
                    .map(|p| p.id),
            );
            return ReconciliationActions::Delete { ids };
        }

        ReconciliationActions::Create {
            count: (state.desired - state.actual - state.starting).max(0),
        }
    }

    /// `last_build_at + num_failed * interval`, or `None` without failures.
    pub fn backoff_until(&self, backoff_interval: Duration) -> Option<DateTime<Utc>> {
        let record = self.backoff.as_ref().filter(|b| b.num_failed > 0)?;

        let factor = u32::try_from(record.num_failed).unwrap_or(u32::MAX);
        let delay = backoff_interval
            .checked_mul(factor)
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or(chrono::Duration::MAX);

        Some(
            record
                .last_build_at
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    fn scale_to_zero(&self) -> ReconciliationActions {
        let (_, _, deleting) = self.count_in_progress();
        let candidates = oldest_first(self.running.iter().chain(self.expired.iter()));
        let to_delete = candidates
            .len()
            .saturating_sub(usize::try_from(deleting).unwrap_or(0));

        ReconciliationActions::Delete {
            ids: candidates
                .into_iter()
                .take(to_delete)
                .map(|p| p.id)
                .collect(),
        }
    }

    fn count_in_progress(&self) -> (i32, i32, i32) {
        let (mut starting, mut stopping, mut deleting) = (0i32, 0i32, 0i32);
        for row in &self.in_progress {
            let bucket = match row.transition {
                Transition::Start => &mut starting,
                Transition::Stop => &mut stopping,
                Transition::Delete => &mut deleting,
            };
            *bucket = bucket.saturating_add(row.count);
        }
        (starting, stopping, deleting)
    }
}

/// Oldest creation time first; equal times fall back to ID order.
fn oldest_first<'a, I>(prebuilds: I) -> Vec<&'a RunningPrebuild>
where
    I: IntoIterator<Item = &'a RunningPrebuild>,
{
    let mut sorted: Vec<_> = prebuilds.into_iter().collect();
    sorted.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    sorted
}

fn len_i32(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use prewarm_id::{PresetId, TemplateId, TemplateVersionId};
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::clock::MockClock;
    use crate::model::{BackoffRecord, InProgressCount, PrebuildSchedule, PresetRow};
    use crate::snapshot::GlobalSnapshot;

    const BACKOFF_INTERVAL: Duration = Duration::from_secs(5);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn preset(desired: Option<i32>) -> PresetRow {
        PresetRow {
            preset_id: PresetId::new(),
            name: "default".to_string(),
            template_id: TemplateId::new(),
            template_version_id: TemplateVersionId::new(),
            desired_instances: desired,
            using_active_version: true,
            deleted: false,
            deprecated: false,
            ttl: None,
            scheduling_timezone: String::new(),
            schedules: vec![],
        }
    }

    fn prebuild(preset: &PresetRow, created_at: DateTime<Utc>, ready: bool) -> RunningPrebuild {
        RunningPrebuild {
            id: PrebuildId::new(),
            name: "prebuild-test".to_string(),
            template_id: preset.template_id,
            template_version_id: preset.template_version_id,
            current_preset_id: Some(preset.preset_id),
            ready,
            created_at,
        }
    }

    fn in_progress(preset: &PresetRow, transition: Transition, count: i32) -> InProgressCount {
        InProgressCount {
            template_id: preset.template_id,
            template_version_id: preset.template_version_id,
            preset_id: Some(preset.preset_id),
            transition,
            count,
        }
    }

    struct Fixture {
        preset: PresetRow,
        running: Vec<RunningPrebuild>,
        in_progress: Vec<InProgressCount>,
        backoffs: Vec<BackoffRecord>,
        clock: Arc<MockClock>,
    }

    impl Fixture {
        fn new(preset: PresetRow) -> Self {
            Self {
                preset,
                running: vec![],
                in_progress: vec![],
                backoffs: vec![],
                clock: Arc::new(MockClock::new(t0())),
            }
        }

        fn snapshot(&self) -> PresetSnapshot {
            GlobalSnapshot::new(
                vec![self.preset.clone()],
                self.running.clone(),
                self.in_progress.clone(),
                self.backoffs.clone(),
                vec![],
                &*self.clock,
            )
            .filter_by_preset(self.preset.preset_id)
            .unwrap()
        }
    }

    #[test]
    fn test_no_prebuilds_configured_is_noop() {
        let fx = Fixture::new(preset(Some(0)));
        let ps = fx.snapshot();

        assert_eq!(ps.calculate_state(), ReconciliationState::default());
        let actions = ps.calculate_actions(BACKOFF_INTERVAL);
        assert_eq!(actions, ReconciliationActions::Create { count: 0 });
        assert!(actions.is_noop());
    }

    #[test]
    fn test_unset_desired_counts_as_zero() {
        let mut fx = Fixture::new(preset(None));
        let p = fx.preset.clone();
        fx.running.push(prebuild(&p, t0(), true));

        let ps = fx.snapshot();
        let state = ps.calculate_state();
        assert_eq!(state.desired, 0);
        assert_eq!(state.extraneous, 1);
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Delete {
                ids: vec![fx.running[0].id]
            }
        );
    }

    #[test]
    fn test_scenario_a_net_new() {
        let fx = Fixture::new(preset(Some(1)));
        let ps = fx.snapshot();

        assert_eq!(
            ps.calculate_state(),
            ReconciliationState {
                desired: 1,
                ..Default::default()
            }
        );
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Create { count: 1 }
        );
    }

    #[test]
    fn test_scenario_b_starting_not_double_counted() {
        let mut fx = Fixture::new(preset(Some(2)));
        let p = fx.preset.clone();
        fx.running.push(prebuild(&p, t0(), true));
        fx.running.push(prebuild(&p, t0(), true));
        fx.in_progress.push(in_progress(&p, Transition::Start, 1));

        let ps = fx.snapshot();
        assert_eq!(
            ps.calculate_state(),
            ReconciliationState {
                actual: 2,
                desired: 2,
                eligible: 2,
                starting: 1,
                ..Default::default()
            }
        );
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Create { count: 0 }
        );
    }

    #[test]
    fn test_scenario_c_deprecated_scales_to_zero() {
        let mut p = preset(Some(1));
        p.deprecated = true;
        let mut fx = Fixture::new(p.clone());
        fx.running.push(prebuild(&p, t0(), true));

        let ps = fx.snapshot();
        let state = ps.calculate_state();
        assert_eq!(state.actual, 0);
        assert_eq!(state.desired, 0);
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Delete {
                ids: vec![fx.running[0].id]
            }
        );
    }

    #[test]
    fn test_deleted_template_treated_like_deprecated() {
        let mut p = preset(Some(3));
        p.deleted = true;
        let mut fx = Fixture::new(p.clone());
        fx.running.push(prebuild(&p, t0(), true));

        let ps = fx.snapshot();
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Delete {
                ids: vec![fx.running[0].id]
            }
        );
    }

    #[test]
    fn test_scenario_d_oldest_extraneous_deleted() {
        let mut fx = Fixture::new(preset(Some(1)));
        let p = fx.preset.clone();
        let older = prebuild(&p, t0() - chrono::Duration::hours(1), true);
        let newer = prebuild(&p, t0(), true);
        fx.running = vec![newer, older.clone()];

        let ps = fx.snapshot();
        let state = ps.calculate_state();
        assert_eq!(state.extraneous, 1);
        assert_eq!(state.eligible, 2);
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Delete {
                ids: vec![older.id]
            }
        );
    }

    #[test]
    fn test_scenario_e_backoff_window() {
        let mut fx = Fixture::new(preset(Some(1)));
        fx.backoffs.push(BackoffRecord {
            preset_id: fx.preset.preset_id,
            num_failed: 1,
            last_build_at: t0(),
        });
        let until = t0() + chrono::Duration::seconds(5);

        fx.clock.set(t0() + chrono::Duration::seconds(3));
        assert_eq!(
            fx.snapshot().calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Backoff { until }
        );

        fx.clock.set(until);
        assert_eq!(
            fx.snapshot().calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Backoff { until }
        );

        fx.clock.set(until + chrono::Duration::milliseconds(1));
        assert_eq!(
            fx.snapshot().calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Create { count: 1 }
        );
    }

    #[test]
    fn test_decisions_fixed_after_clock_moves() {
        let mut fx = Fixture::new(preset(Some(1)));
        fx.backoffs.push(BackoffRecord {
            preset_id: fx.preset.preset_id,
            num_failed: 1,
            last_build_at: t0(),
        });
        let until = t0() + chrono::Duration::seconds(5);

        let ps = fx.snapshot();
        let first = ps.calculate_actions(BACKOFF_INTERVAL);
        assert_eq!(first, ReconciliationActions::Backoff { until });

        fx.clock.advance(chrono::Duration::seconds(6));
        assert_eq!(ps.calculate_actions(BACKOFF_INTERVAL), first);

        // A fresh snapshot sees the new time.
        assert_eq!(
            fx.snapshot().calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Create { count: 1 }
        );
    }

    #[test]
    fn test_schedule_raises_desired_count() {
        let mut p = preset(Some(1));
        p.scheduling_timezone = "UTC".to_string();
        p.schedules = vec![PrebuildSchedule {
            cron_expression: "* 9-17 * * *".to_string(),
            desired_instances: 3,
        }];
        let mut fx = Fixture::new(p.clone());
        fx.running.push(prebuild(&p, t0() - chrono::Duration::hours(4), true));

        // t0 is 12:00 UTC, inside the range.
        let ps = fx.snapshot();
        assert_eq!(ps.calculate_state().desired, 3);
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Create { count: 2 }
        );

        // After hours the default applies and the surplus goes.
        fx.clock.set(t0() + chrono::Duration::hours(8));
        fx.running.push(prebuild(&p, t0(), true));
        let ps = fx.snapshot();
        assert_eq!(ps.calculate_state().desired, 1);
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Delete {
                ids: vec![fx.running[0].id]
            }
        );
    }

    #[test]
    fn test_overlapping_schedules_fall_back_to_default() {
        let mut p = preset(Some(1));
        p.scheduling_timezone = "UTC".to_string();
        p.schedules = vec![
            PrebuildSchedule {
                cron_expression: "* 9-17 * * *".to_string(),
                desired_instances: 3,
            },
            PrebuildSchedule {
                cron_expression: "* 12 * * *".to_string(),
                desired_instances: 5,
            },
        ];
        let fx = Fixture::new(p);

        let ps = fx.snapshot();
        assert!(ps.active_schedule().is_err());
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Create { count: 1 }
        );
    }

    #[test]
    fn test_backoff_scales_linearly_with_failures() {
        let mut fx = Fixture::new(preset(Some(1)));
        fx.backoffs.push(BackoffRecord {
            preset_id: fx.preset.preset_id,
            num_failed: 3,
            last_build_at: t0(),
        });

        let ps = fx.snapshot();
        assert_eq!(
            ps.backoff_until(BACKOFF_INTERVAL),
            Some(t0() + chrono::Duration::seconds(15))
        );
    }

    #[test]
    fn test_zero_failures_means_no_backoff() {
        let mut fx = Fixture::new(preset(Some(1)));
        fx.backoffs.push(BackoffRecord {
            preset_id: fx.preset.preset_id,
            num_failed: 0,
            last_build_at: t0(),
        });

        let ps = fx.snapshot();
        assert_eq!(ps.backoff_until(BACKOFF_INTERVAL), None);
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Create { count: 1 }
        );
    }

    #[test]
    fn test_backoff_precedes_deletion() {
        let mut p = preset(Some(1));
        p.using_active_version = false;
        let mut fx = Fixture::new(p.clone());
        fx.running.push(prebuild(&p, t0(), true));
        fx.backoffs.push(BackoffRecord {
            preset_id: p.preset_id,
            num_failed: 2,
            last_build_at: t0(),
        });

        assert_eq!(
            fx.snapshot().calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Backoff {
                until: t0() + chrono::Duration::seconds(10)
            }
        );
    }

    #[test]
    fn test_superseded_version_deletes_oldest_first_minus_deleting() {
        let mut p = preset(Some(2));
        p.using_active_version = false;
        let mut fx = Fixture::new(p.clone());
        let a = prebuild(&p, t0() - chrono::Duration::minutes(30), true);
        let b = prebuild(&p, t0() - chrono::Duration::minutes(20), false);
        let c = prebuild(&p, t0() - chrono::Duration::minutes(10), true);
        fx.running = vec![c, a.clone(), b.clone()];
        fx.in_progress.push(in_progress(&p, Transition::Delete, 1));

        let ps = fx.snapshot();
        let state = ps.calculate_state();
        assert_eq!(
            state,
            ReconciliationState {
                deleting: 1,
                ..Default::default()
            }
        );
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Delete {
                ids: vec![a.id, b.id]
            }
        );
    }

    #[test]
    fn test_inactive_with_more_deleting_than_running() {
        let mut p = preset(Some(2));
        p.using_active_version = false;
        let mut fx = Fixture::new(p.clone());
        fx.running.push(prebuild(&p, t0(), true));
        fx.in_progress.push(in_progress(&p, Transition::Delete, 3));

        assert_eq!(
            fx.snapshot().calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Delete { ids: vec![] }
        );
    }

    #[test]
    fn test_expired_deleted_before_creating() {
        let mut p = preset(Some(2));
        p.ttl = Some(Duration::from_secs(600));
        let mut fx = Fixture::new(p.clone());
        let stale = prebuild(&p, t0() - chrono::Duration::minutes(15), true);
        let fresh = prebuild(&p, t0() - chrono::Duration::minutes(5), true);
        fx.running = vec![fresh, stale.clone()];

        let ps = fx.snapshot();
        let state = ps.calculate_state();
        assert_eq!(state.actual, 1);
        assert_eq!(state.expired, 1);
        assert_eq!(state.extraneous, 0);
        assert_eq!(
            ps.calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Delete {
                ids: vec![stale.id]
            }
        );
    }

    #[test]
    fn test_expired_and_extraneous_deleted_together() {
        let mut p = preset(Some(1));
        p.ttl = Some(Duration::from_secs(600));
        let mut fx = Fixture::new(p.clone());
        let stale = prebuild(&p, t0() - chrono::Duration::minutes(15), true);
        let old = prebuild(&p, t0() - chrono::Duration::minutes(8), true);
        let young = prebuild(&p, t0() - chrono::Duration::minutes(1), true);
        fx.running = vec![young, old.clone(), stale.clone()];

        assert_eq!(
            fx.snapshot().calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Delete {
                ids: vec![stale.id, old.id]
            }
        );
    }

    #[test]
    fn test_equal_creation_times_break_ties_by_id() {
        let mut fx = Fixture::new(preset(Some(1)));
        let p = fx.preset.clone();
        let first = prebuild(&p, t0(), true);
        let second = prebuild(&p, t0(), true);
        let (low, _high) = if first.id < second.id {
            (first.clone(), second.clone())
        } else {
            (second.clone(), first.clone())
        };
        fx.running = vec![second, first];

        assert_eq!(
            fx.snapshot().calculate_actions(BACKOFF_INTERVAL),
            ReconciliationActions::Delete { ids: vec![low.id] }
        );
    }

    #[test]
    fn test_eligible_counts_only_ready() {
        let mut fx = Fixture::new(preset(Some(3)));
        let p = fx.preset.clone();
        fx.running.push(prebuild(&p, t0(), true));
        fx.running.push(prebuild(&p, t0(), false));

        let state = fx.snapshot().calculate_state();
        assert_eq!(state.actual, 2);
        assert_eq!(state.eligible, 1);
    }

    #[rstest]
    // One desired, one starting: wait for it.
    #[case(Transition::Start, 1, 0, 1, ReconciliationActions::Create { count: 0 })]
    #[case(Transition::Start, 2, 1, 1, ReconciliationActions::Create { count: 0 })]
    #[case(Transition::Start, 3, 1, 2, ReconciliationActions::Create { count: 0 })]
    // Stopping and deleting prebuilds do not count toward the desired total.
    #[case(Transition::Stop, 1, 0, 1, ReconciliationActions::Create { count: 1 })]
    #[case(Transition::Stop, 3, 2, 1, ReconciliationActions::Create { count: 1 })]
    #[case(Transition::Stop, 3, 3, 1, ReconciliationActions::Create { count: 0 })]
    #[case(Transition::Delete, 1, 0, 1, ReconciliationActions::Create { count: 1 })]
    #[case(Transition::Delete, 2, 1, 1, ReconciliationActions::Create { count: 1 })]
    #[case(Transition::Delete, 2, 2, 1, ReconciliationActions::Create { count: 0 })]
    fn test_in_progress_transitions(
        #[case] transition: Transition,
        #[case] desired: i32,
        #[case] running: usize,
        #[case] count: i32,
        #[case] expected: ReconciliationActions,
    ) {
        let mut fx = Fixture::new(preset(Some(desired)));
        let p = fx.preset.clone();
        for _ in 0..running {
            fx.running.push(prebuild(&p, t0(), false));
        }
        fx.in_progress.push(in_progress(&p, transition, count));

        assert_eq!(fx.snapshot().calculate_actions(BACKOFF_INTERVAL), expected);
    }

    #[test]
    fn test_extraneous_deleted_while_others_deleting() {
        let mut fx = Fixture::new(preset(Some(3)));
        let p = fx.preset.clone();
        for minutes in 0..5 {
            fx.running
                .push(prebuild(&p, t0() - chrono::Duration::minutes(minutes), true));
        }
        fx.in_progress.push(in_progress(&p, Transition::Delete, 2));

        let ps = fx.snapshot();
        let state = ps.calculate_state();
        assert_eq!(state.extraneous, 2);
        assert_eq!(state.deleting, 2);
        match ps.calculate_actions(BACKOFF_INTERVAL) {
            ReconciliationActions::Delete { ids } => assert_eq!(ids.len(), 2),
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn test_action_type_and_noop() {
        assert_eq!(
            ReconciliationActions::Create { count: 2 }.action_type(),
            ActionType::Create
        );
        assert!(!ReconciliationActions::Create { count: 2 }.is_noop());
        assert!(ReconciliationActions::Delete { ids: vec![] }.is_noop());
        assert!(!ReconciliationActions::Backoff { until: t0() }.is_noop());
        assert_eq!(ActionType::Backoff.to_string(), "backoff");
    }

    proptest! {
        #[test]
        fn prop_calculations_are_idempotent(
            desired in 0i32..6,
            ages in proptest::collection::vec(0i64..600, 0..8),
            starting in 0i32..3,
        ) {
            let mut fx = Fixture::new(preset(Some(desired)));
            let p = fx.preset.clone();
            for age in &ages {
                fx.running.push(prebuild(&p, t0() - chrono::Duration::minutes(*age), true));
            }
            fx.in_progress.push(in_progress(&p, Transition::Start, starting));

            let ps = fx.snapshot();
            prop_assert_eq!(ps.calculate_state(), ps.calculate_state());
            prop_assert_eq!(
                ps.calculate_actions(BACKOFF_INTERVAL),
                ps.calculate_actions(BACKOFF_INTERVAL)
            );
        }

        #[test]
        fn prop_extraneous_deletes_exactly_the_oldest(
            desired in 0i32..4,
            ages in proptest::collection::vec(0i64..10_000, 0..10),
        ) {
            let mut fx = Fixture::new(preset(Some(desired)));
            let p = fx.preset.clone();
            for age in &ages {
                fx.running.push(prebuild(&p, t0() - chrono::Duration::seconds(*age), true));
            }

            let ps = fx.snapshot();
            let state = ps.calculate_state();
            let actual = ages.len() as i32;
            prop_assert_eq!(state.extraneous, (actual - desired).max(0));

            match ps.calculate_actions(BACKOFF_INTERVAL) {
                ReconciliationActions::Delete { ids } => {
                    prop_assert!(state.extraneous > 0);
                    let mut expected = fx.running.clone();
                    expected.sort_by(|a, b| {
                        a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
                    });
                    let expected: Vec<_> = expected
                        .into_iter()
                        .take(state.extraneous as usize)
                        .map(|p| p.id)
                        .collect();
                    prop_assert_eq!(ids, expected);
                }
                ReconciliationActions::Create { count } => {
                    prop_assert_eq!(state.extraneous, 0);
                    prop_assert_eq!(count, (desired - actual).max(0));
                }
                ReconciliationActions::Backoff { .. } => {
                    prop_assert!(false, "no backoff configured")
                }
            }
        }

        #[test]
        fn prop_inactive_never_creates(
            desired in 0i32..6,
            running in 0usize..6,
            deleting in 0i32..4,
        ) {
            let mut p = preset(Some(desired));
            p.using_active_version = false;
            let mut fx = Fixture::new(p.clone());
            for _ in 0..running {
                fx.running.push(prebuild(&p, t0(), true));
            }
            fx.in_progress.push(in_progress(&p, Transition::Delete, deleting));

            match fx.snapshot().calculate_actions(BACKOFF_INTERVAL) {
                ReconciliationActions::Delete { ids } => {
                    prop_assert_eq!(ids.len(), running.saturating_sub(deleting as usize));
                }
                other => prop_assert!(false, "unexpected action {:?}", other),
            }
        }
    }
}

//! Prebuild reconciliation core.
//!
//! This library holds the part of the reconciler that needs no I/O:
//!
//! - **Snapshot**: an immutable view of presets, running prebuilds,
//!   in-flight transitions, failure backoffs and hard limits.
//! - **State**: per-preset counts derived from a snapshot
//!   (actual, desired, eligible, extraneous, in-flight).
//! - **Schedules**: cron-style time ranges that change a preset's desired
//!   count during parts of the day or week.
//! - **Actions**: the one step (create, delete or back off) that moves a
//!   preset toward its desired state.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same snapshot; the clock is read
//!   once, when the snapshot is built
//! - A preset never receives a create and a delete in the same pass
//! - Deletion always removes the oldest prebuilds first

mod actions;
mod clock;
mod error;
mod model;
mod schedule;
mod snapshot;

pub use actions::{ActionType, ReconciliationActions, ReconciliationState};
pub use clock::{Clock, MockClock, SystemClock};
pub use error::{ScheduleError, SnapshotError};
pub use model::{
    BackoffRecord, InProgressCount, PrebuildSchedule, PresetRow, PresetStatus, RunningPrebuild,
    Transition, UnknownTransition,
};
pub use schedule::{active_schedule, validate_schedules, TimeRange};
pub use snapshot::{GlobalSnapshot, PresetSnapshot};

use std::time::Duration;

/// Default pause between reconciliation passes.
pub const DEFAULT_RECONCILIATION_INTERVAL: Duration = Duration::from_secs(15);

/// Default backoff added per consecutive failed build.
pub const DEFAULT_BACKOFF_INTERVAL: Duration = Duration::from_secs(15);

/// Default window in which failed builds count toward backoff.
pub const DEFAULT_BACKOFF_LOOKBACK: Duration = Duration::from_secs(60 * 60);

/// Default number of consecutive failures after which a preset is hard limited.
pub const DEFAULT_FAILURE_HARD_LIMIT: u32 = 3;

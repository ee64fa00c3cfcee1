use prewarm_id::PresetId;
use thiserror::Error;

/// Errors raised while narrowing a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The preset is not part of the snapshot, usually because it was
    /// removed between listing presets and reconciling them.
    #[error("preset not found in snapshot: {0}")]
    PresetNotFound(PresetId),
}

/// Errors in a preset's prebuild scheduling configuration.
///
/// Any of these makes the preset fall back to its default desired count.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedules are set but no timezone is configured")]
    MissingTimezone,

    #[error("unknown timezone: {0:?}")]
    InvalidTimezone(String),

    #[error("expected 5 cron fields, got {count} in {expression:?}")]
    FieldCount { expression: String, count: usize },

    #[error("the minute field must be '*' in {0:?}")]
    MinuteNotWildcard(String),

    #[error("invalid {field} field {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("schedules {first:?} and {second:?} overlap")]
    Overlap { first: String, second: String },
}

//! Facts read from the store, one struct per query.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prewarm_id::{PrebuildId, PresetId, TemplateId, TemplateVersionId};

/// A preset that has prebuilds configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetRow {
    pub preset_id: PresetId,
    pub name: String,
    pub template_id: TemplateId,
    pub template_version_id: TemplateVersionId,
    /// `None` means zero.
    pub desired_instances: Option<i32>,
    /// True iff the preset's version is the template's active version.
    pub using_active_version: bool,
    pub deleted: bool,
    pub deprecated: bool,
    /// Prebuilds older than this are considered expired.
    pub ttl: Option<Duration>,
    /// IANA zone the schedules are read in, e.g. `Europe/Berlin`.
    pub scheduling_timezone: String,
    /// Time ranges that override `desired_instances` while they are in force.
    pub schedules: Vec<PrebuildSchedule>,
}

impl PresetRow {
    pub fn status(&self) -> PresetStatus {
        PresetStatus::from_flags(self.using_active_version, self.deleted, self.deprecated)
    }
}

/// A time range during which a preset wants a different number of prebuilds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrebuildSchedule {
    /// Five-field cron expression read as a range; see [`TimeRange`](crate::TimeRange).
    pub cron_expression: String,
    pub desired_instances: i32,
}

/// Whether a preset should currently have prebuilds.
///
/// When several conditions hold at once the most terminal one wins:
/// `Deleted`, then `Deprecated`, then `Superseded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresetStatus {
    Active,
    /// The preset's template version is no longer the active one.
    Superseded,
    Deleted,
    Deprecated,
}

impl PresetStatus {
    pub fn from_flags(using_active_version: bool, deleted: bool, deprecated: bool) -> Self {
        if deleted {
            Self::Deleted
        } else if deprecated {
            Self::Deprecated
        } else if !using_active_version {
            Self::Superseded
        } else {
            Self::Active
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
            Self::Deleted => "deleted",
            Self::Deprecated => "deprecated",
        }
    }
}

impl fmt::Display for PresetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prebuilt workspace whose latest build started successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningPrebuild {
    pub id: PrebuildId,
    pub name: String,
    pub template_id: TemplateId,
    pub template_version_id: TemplateVersionId,
    pub current_preset_id: Option<PresetId>,
    /// All agents reported healthy.
    pub ready: bool,
    pub created_at: DateTime<Utc>,
}

/// Kind of build a workspace is undergoing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Start,
    Stop,
    Delete,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transition {
    type Err = UnknownTransition;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "delete" => Ok(Self::Delete),
            other => Err(UnknownTransition(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown workspace transition: {0}")]
pub struct UnknownTransition(pub String);

/// Number of prebuilds currently in one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InProgressCount {
    pub template_id: TemplateId,
    pub template_version_id: TemplateVersionId,
    /// Rows without a preset are not attributed to any preset.
    pub preset_id: Option<PresetId>,
    pub transition: Transition,
    pub count: i32,
}

/// Recent consecutive build failures for a preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffRecord {
    pub preset_id: PresetId,
    pub num_failed: i32,
    pub last_build_at: DateTime<Utc>,
}

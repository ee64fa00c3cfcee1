//! Typed IDs for everything the prebuild engine touches.

use crate::define_id;

// =============================================================================
// Templates and presets
// =============================================================================

define_id!(TemplateId, "tpl");
define_id!(TemplateVersionId, "tv");
define_id!(PresetId, "pst");

// =============================================================================
// Workspaces
// =============================================================================

define_id!(PrebuildId, "pb");
define_id!(BuildJobId, "job");

// =============================================================================
// Principals
// =============================================================================

define_id!(UserId, "usr");

impl UserId {
    /// The system user that owns every unclaimed prebuild.
    pub const PREBUILDS_OWNER: Self = Self::from_ulid(crate::Ulid(0));

    /// Returns true for the system prebuilds owner.
    #[must_use]
    pub fn is_prebuilds_owner(&self) -> bool {
        *self == Self::PREBUILDS_OWNER
    }
}

// =============================================================================
// Tests
// =============================================================================

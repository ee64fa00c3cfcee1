//! Advisory lock keys shared by every control-plane replica.

use prewarm_id::TemplateId;
use sha2::{Digest, Sha256};

/// Opaque key for a store-provided advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey(i64);

impl LockKey {
    /// Held for the duration of a reconciliation pass.
    pub const RECONCILE_ALL: Self = Self(0x7072_6562_7569_6c64);

    /// Key for reconciling a single template's presets.
    pub fn for_template(template_id: TemplateId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"prebuilds:template:");
        hasher.update(template_id.to_string().as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(i64::from_be_bytes(bytes))
    }

    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

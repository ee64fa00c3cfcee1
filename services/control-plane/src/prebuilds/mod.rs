//! Prebuild reconciliation service.
//!
//! Keeps a pool of ready-to-claim workspaces ("prebuilds") for every preset
//! that asks for them:
//!
//! - [`Orchestrator`] runs passes on an interval and on demand (nudges)
//! - [`Reconciler`] reads a snapshot, diffs each preset and applies actions
//! - [`Provisioner`] turns actions into build requests
//! - [`Claimer`] hands a ready prebuild to a user
//!
//! Decisions themselves live in `prewarm_reconcile`; this module is the I/O
//! around them.

mod claim;
mod locks;
pub mod memory;
mod orchestrator;
mod provisioner;
mod reconciler;
mod snapshot_reader;
mod store;

pub use claim::{ClaimError, Claimer, NoopClaimer, StoreClaimer};
pub use locks::LockKey;
pub use orchestrator::{LoopState, Orchestrator};
pub use provisioner::{
    generate_name, parameters_for_preset, BuildParameter, DeleteRequest, PrebuildRequest,
    PresetParameter, ProvisionError, Provisioner,
};
pub use reconciler::{ReconcileError, ReconcileStats, Reconciler};
pub use snapshot_reader::SnapshotReader;
pub use store::{PrebuildStore, SnapshotFacts, SnapshotQuery, StoreError, StoreResult};

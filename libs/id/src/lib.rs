//! # prewarm-id
//!
//! Typed identifiers for templates, presets, prebuilt workspaces and users.
//!
//! Every ID renders as `{prefix}_{ulid}`:
//!
//! - `tpl_01HV4Z2WQXKJNM8GPQY6VBKC3D` (template)
//! - `pst_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (preset)
//! - `pb_01HV4Z4NYPLTRS0JTUA8XDME5F` (prebuilt workspace)
//!
//! The prefix keeps IDs of different resources from being mixed up, and the
//! ULID makes IDs sort in creation order, which the reconciler relies on to
//! break ties deterministically.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

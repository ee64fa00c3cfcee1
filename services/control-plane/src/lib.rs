//! prewarm control plane library.
//!
//! This crate primarily ships a `control-plane` binary that keeps prebuilt
//! workspaces warm, but we expose a small library surface to enable
//! integration testing and reuse.

pub mod config;
pub mod db;
pub mod prebuilds;

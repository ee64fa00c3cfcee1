//! Interface to the subsystem that actually builds and tears down workspaces.
//!
//! The reconciler only issues requests; builds run asynchronously and their
//! outcome shows up in later snapshots.

use async_trait::async_trait;
use prewarm_id::{BuildJobId, PrebuildId, PresetId, TemplateId, TemplateVersionId};
use prewarm_reconcile::PresetRow;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("prebuild not found: {0}")]
    NotFound(PrebuildId),

    /// The prebuild was claimed by a user after the snapshot was taken.
    #[error("prebuild already claimed: {0}")]
    Claimed(PrebuildId),

    #[error("provisioning rejected: {0}")]
    Rejected(String),
}

/// Request to provision one new prebuild for a preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrebuildRequest {
    pub prebuild_id: PrebuildId,
    pub name: String,
    pub template_id: TemplateId,
    pub template_version_id: TemplateVersionId,
    pub preset_id: PresetId,
}

impl PrebuildRequest {
    /// A fresh request with a new ID and generated name.
    pub fn for_preset(preset: &PresetRow) -> Self {
        Self {
            prebuild_id: PrebuildId::new(),
            name: generate_name(),
            template_id: preset.template_id,
            template_version_id: preset.template_version_id,
            preset_id: preset.preset_id,
        }
    }
}

/// Request to tear down an existing prebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub prebuild_id: PrebuildId,
    pub template_id: TemplateId,
    pub preset_id: PresetId,
}

#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    async fn create_prebuild(&self, request: &PrebuildRequest) -> Result<BuildJobId, ProvisionError>;

    async fn delete_prebuild(&self, request: &DeleteRequest) -> Result<BuildJobId, ProvisionError>;
}

/// A parameter value a preset pins for its template version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetParameter {
    pub preset_id: PresetId,
    pub name: String,
    pub value: String,
}

/// A parameter passed to a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParameter {
    pub name: String,
    pub value: String,
}

/// Picks the parameters that belong to `preset_id` out of every preset
/// parameter defined on a template version.
pub fn parameters_for_preset(params: &[PresetParameter], preset_id: PresetId) -> Vec<BuildParameter> {
    params
        .iter()
        .filter(|p| p.preset_id == preset_id)
        .map(|p| BuildParameter {
            name: p.name.clone(),
            value: p.value.clone(),
        })
        .collect()
}

/// Generates a prebuild workspace name such as `prebuild-3f9a0c41d2e87b6a5c`.
///
/// Nine random bytes keep the name short enough for cloud resource names
/// while making collisions negligible.
pub fn generate_name() -> String {
    let mut bytes = [0u8; 9];
    rand::rng().fill(&mut bytes);
    format!("prebuild-{}", hex::encode(bytes))
}

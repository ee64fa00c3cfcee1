//! Handing a ready prebuild to a user.

use std::sync::Arc;

use async_trait::async_trait;
use prewarm_id::{PrebuildId, PresetId, UserId};
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::store::{PrebuildStore, StoreError};

/// Longest workspace name a user may choose.
const MAX_NAME_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ClaimError {
    /// Claiming is unavailable; callers provision a workspace on demand.
    #[error("prebuild claiming is not enabled")]
    NotEntitled,

    #[error("invalid workspace name: {0:?}")]
    InvalidName(String),

    #[error("the prebuilds owner cannot claim prebuilds")]
    ReservedUser,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Strategy for claiming a prebuild.
#[async_trait]
pub trait Claimer: Send + Sync {
    /// Reassigns one ready prebuild of `preset_id` to `user_id` under the
    /// workspace name `name`. `Ok(None)` means no prebuild was available.
    async fn claim(
        &self,
        user_id: UserId,
        name: &str,
        preset_id: PresetId,
    ) -> Result<Option<PrebuildId>, ClaimError>;
}

/// Claims prebuilds through the store.
pub struct StoreClaimer<S> {
    store: Arc<S>,
}

impl<S> StoreClaimer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: PrebuildStore> Claimer for StoreClaimer<S> {
    #[instrument(skip(self))]
    async fn claim(
        &self,
        user_id: UserId,
        name: &str,
        preset_id: PresetId,
    ) -> Result<Option<PrebuildId>, ClaimError> {
        if user_id.is_prebuilds_owner() {
            return Err(ClaimError::ReservedUser);
        }
        validate_name(name)?;

        let claimed = self.store.claim_prebuild(user_id, name, preset_id).await?;
        match claimed {
            Some(prebuild_id) => info!(prebuild_id = %prebuild_id, name, "Claimed prebuild"),
            None => debug!("No ready prebuild to claim"),
        }
        Ok(claimed)
    }
}

/// Claimer used when prebuilds are not available to the deployment.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopClaimer;

#[async_trait]
impl Claimer for NoopClaimer {
    async fn claim(
        &self,
        _user_id: UserId,
        _name: &str,
        _preset_id: PresetId,
    ) -> Result<Option<PrebuildId>, ClaimError> {
        Err(ClaimError::NotEntitled)
    }
}

/// Workspace names are 1-32 alphanumeric characters, with single hyphens
/// allowed between them.
fn validate_name(name: &str) -> Result<(), ClaimError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .split('-')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric()));

    if valid {
        Ok(())
    } else {
        Err(ClaimError::InvalidName(name.to_string()))
    }
}

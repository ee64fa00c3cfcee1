//! Assembles a [`GlobalSnapshot`] from the store.

use std::sync::Arc;
use std::time::Duration;

use prewarm_id::TemplateId;
use prewarm_reconcile::{Clock, GlobalSnapshot};
use tracing::{debug, instrument};

use super::store::{PrebuildStore, SnapshotQuery, StoreResult};

/// Reads everything one reconciliation pass needs.
#[derive(Debug)]
pub struct SnapshotReader<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    backoff_lookback: Duration,
    failure_hard_limit: u32,
}

impl<S> Clone for SnapshotReader<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            backoff_lookback: self.backoff_lookback,
            failure_hard_limit: self.failure_hard_limit,
        }
    }
}

impl<S: PrebuildStore> SnapshotReader<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        backoff_lookback: Duration,
        failure_hard_limit: u32,
    ) -> Self {
        Self {
            store,
            clock,
            backoff_lookback,
            failure_hard_limit,
        }
    }

    /// Reads a snapshot of every template, or of one when `template_id` is set.
    #[instrument(skip(self))]
    pub async fn read(&self, template_id: Option<TemplateId>) -> StoreResult<GlobalSnapshot> {
        let query = SnapshotQuery {
            template_id,
            backoff_lookback: self.backoff_lookback,
            failure_hard_limit: self.failure_hard_limit,
        };
        let facts = self.store.read_snapshot(&query).await?;

        debug!(presets = facts.presets.len(), "Snapshot assembled");

        Ok(GlobalSnapshot::new(
            facts.presets,
            facts.running,
            facts.in_progress,
            facts.backoffs,
            facts.hard_limited,
            self.clock.as_ref(),
        ))
    }
}

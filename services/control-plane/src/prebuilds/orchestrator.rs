//! Background loop that runs reconciliation passes.
//!
//! Passes run on a fixed interval. A nudge asks for an early pass over one
//! template; nudges share a single-slot queue so a burst collapses into one
//! pass instead of blocking the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use prewarm_id::TemplateId;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::provisioner::Provisioner;
use super::reconciler::{ReconcileError, Reconciler};
use super::store::PrebuildStore;

/// Lifecycle of the reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Reconciling,
    Stopped,
}

/// Owns the reconciliation loop for one control-plane replica.
pub struct Orchestrator<S, P> {
    reconciler: Reconciler<S, P>,
    interval: Duration,
    nudge_tx: mpsc::Sender<TemplateId>,
    nudge_rx: Mutex<Option<mpsc::Receiver<TemplateId>>>,
    cancel_tx: Arc<watch::Sender<bool>>,
    state_tx: watch::Sender<LoopState>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<S: PrebuildStore, P: Provisioner> Orchestrator<S, P> {
    pub fn new(reconciler: Reconciler<S, P>, interval: Duration) -> Self {
        let (nudge_tx, nudge_rx) = mpsc::channel(1);
        let (cancel_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(LoopState::Idle);

        Self {
            reconciler,
            interval,
            nudge_tx,
            nudge_rx: Mutex::new(Some(nudge_rx)),
            cancel_tx: Arc::new(cancel_tx),
            state_tx,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state_tx.borrow()
    }

    /// Runs until `shutdown` flips to true or [`Orchestrator::stop`] is called.
    ///
    /// The first pass runs one interval after start. Only one loop may run per
    /// orchestrator; later calls return immediately.
    #[instrument(skip(self, shutdown))]
    pub async fn run_loop(&self, shutdown: watch::Receiver<bool>) {
        let nudges = self
            .nudge_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut nudges) = nudges else {
            warn!("Prebuild reconciliation loop already started");
            return;
        };

        let mut cancel = self.cancel_tx.subscribe();
        self.started.store(true, Ordering::SeqCst);
        if self.stopped.load(Ordering::SeqCst) {
            self.state_tx.send_replace(LoopState::Stopped);
            return;
        }

        // Forward external shutdown into our own cancellation so in-flight
        // passes observe it too.
        let forwarder = {
            let cancel_tx = Arc::clone(&self.cancel_tx);
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        cancel_tx.send_replace(true);
                        break;
                    }
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
        };

        info!(
            interval_secs = self.interval.as_secs(),
            "Starting prebuild reconciliation loop"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Don't immediately tick on startup - wait for first interval
        ticker.tick().await;

        loop {
            if *cancel.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    self.run_pass(None, &cancel).await;
                }
                Some(template_id) = nudges.recv() => {
                    self.run_pass(Some(template_id), &cancel).await;
                }
                _ = cancel.changed() => {}
            }
        }

        forwarder.abort();
        self.state_tx.send_replace(LoopState::Stopped);
        info!("Prebuild reconciliation loop stopped");
    }

    async fn run_pass(&self, scope: Option<TemplateId>, cancel: &watch::Receiver<bool>) {
        self.state_tx.send_replace(LoopState::Reconciling);

        let result = match scope {
            Some(template_id) => {
                self.reconciler
                    .reconcile_template(cancel.clone(), template_id)
                    .await
            }
            None => self.reconciler.reconcile_all(cancel.clone()).await,
        };

        match result {
            Ok(_) => {}
            Err(ReconcileError::Cancelled) => debug!("Reconciliation pass cancelled"),
            Err(e) => error!(error = %e, "Prebuild reconciliation pass failed"),
        }

        self.state_tx.send_if_modified(|state| {
            if *state == LoopState::Reconciling {
                *state = LoopState::Idle;
                true
            } else {
                false
            }
        });
    }

    /// Requests an early pass over one template.
    ///
    /// Returns false when the nudge was dropped because one is already
    /// queued or the loop has stopped.
    pub fn nudge(&self, template_id: TemplateId) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }

        match self.nudge_tx.try_send(template_id) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(template_id = %template_id, "Nudge dropped, one is already queued");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Cancels the loop and waits up to `timeout` for it to exit.
    pub async fn stop(&self, timeout: Duration, cause: &str) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(cause, "Stopping prebuild reconciliation loop");
        self.cancel_tx.send_replace(true);

        if !self.started.load(Ordering::SeqCst) {
            self.state_tx.send_replace(LoopState::Stopped);
            return;
        }

        let mut state = self.state_tx.subscribe();
        let stopped = tokio::time::timeout(
            timeout,
            state.wait_for(|state| *state == LoopState::Stopped),
        )
        .await;

        if stopped.is_err() {
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                "Prebuild reconciliation loop did not stop in time"
            );
        }
    }
}

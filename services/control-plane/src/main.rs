//! prewarm Control Plane
//!
//! Runs the prebuild reconciliation loop: every replica takes part, and
//! advisory locks in Postgres keep passes from overlapping.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prewarm_control_plane::{
    config,
    db::Database,
    prebuilds::{Orchestrator, Reconciler},
};
use prewarm_reconcile::SystemClock;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PREWARM_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting prewarm control plane");
    info!(
        reconciliation_interval_secs = config.prebuilds.effective_interval().as_secs(),
        backoff_interval_secs = config.prebuilds.backoff_interval.as_secs(),
        failure_hard_limit = config.prebuilds.failure_hard_limit,
        "Configuration loaded"
    );

    // Connect to database
    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let reconciler = Reconciler::new(
        Arc::new(db.prebuild_store()),
        Arc::new(db.provisioner()),
        Arc::new(SystemClock),
        &config.prebuilds,
    );
    let orchestrator = Arc::new(Orchestrator::new(
        reconciler,
        config.prebuilds.effective_interval(),
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_handle = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            orchestrator.run_loop(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    let shutdown_timeout = Duration::from_secs(10);
    orchestrator
        .stop(shutdown_timeout, "received shutdown signal")
        .await;
    let _ = shutdown_tx.send(true);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, loop_handle).await {
        warn!(error = %e, "Reconciliation loop did not shut down in time");
    }

    db.pool().close().await;
    info!("Control plane shutdown complete");
    Ok(())
}

use std::time::Duration;

use anyhow::{ensure, Result};
use prewarm_reconcile::{
    DEFAULT_BACKOFF_INTERVAL, DEFAULT_BACKOFF_LOOKBACK, DEFAULT_FAILURE_HARD_LIMIT,
    DEFAULT_RECONCILIATION_INTERVAL,
};

use crate::db::DbConfig;

/// Interval used when the configured one is zero.
const FALLBACK_RECONCILIATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub prebuilds: PrebuildsConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("PREWARM_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("PREWARM_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_env();
        let prebuilds = PrebuildsConfig::from_env()?;

        let config = Self {
            log_level,
            dev_mode,
            database,
            prebuilds,
        };
        config.validate()?;
        Ok(config)
    }

    /// Every held advisory lock pins a pooled connection for the length of
    /// a pass: one for the global lock and one per template in flight. The
    /// pool needs at least one more on top of those for the queries.
    pub fn validate(&self) -> Result<()> {
        let templates = u32::try_from(self.prebuilds.max_concurrent_templates.max(1))?;
        let required = templates.saturating_add(2);
        ensure!(
            self.database.max_connections >= required,
            "DB_MAX_CONNECTIONS is {} but {} concurrent templates need at least {}",
            self.database.max_connections,
            templates,
            required
        );
        Ok(())
    }
}

/// Tuning for the prebuild reconciliation loop.
#[derive(Debug, Clone)]
pub struct PrebuildsConfig {
    /// Time between scheduled passes.
    pub reconciliation_interval: Duration,

    /// Backoff added per consecutive failed build.
    pub backoff_interval: Duration,

    /// How far back failed builds count toward backoff.
    pub backoff_lookback: Duration,

    /// Consecutive failures after which a preset is no longer reconciled.
    /// Zero disables the limit.
    pub failure_hard_limit: u32,

    /// Templates reconciled at the same time within one pass. Each holds a
    /// database connection for its lock, so the pool needs at least this
    /// many plus two; see [`Config::validate`].
    pub max_concurrent_templates: usize,
}

impl Default for PrebuildsConfig {
    fn default() -> Self {
        Self {
            reconciliation_interval: DEFAULT_RECONCILIATION_INTERVAL,
            backoff_interval: DEFAULT_BACKOFF_INTERVAL,
            backoff_lookback: DEFAULT_BACKOFF_LOOKBACK,
            failure_hard_limit: DEFAULT_FAILURE_HARD_LIMIT,
            max_concurrent_templates: 4,
        }
    }
}

impl PrebuildsConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            reconciliation_interval: env_secs(
                "PREWARM_PREBUILDS_RECONCILIATION_INTERVAL_SECS",
                defaults.reconciliation_interval,
            )?,
            backoff_interval: env_secs(
                "PREWARM_PREBUILDS_BACKOFF_INTERVAL_SECS",
                defaults.backoff_interval,
            )?,
            backoff_lookback: env_secs(
                "PREWARM_PREBUILDS_BACKOFF_LOOKBACK_SECS",
                defaults.backoff_lookback,
            )?,
            failure_hard_limit: match std::env::var("PREWARM_PREBUILDS_FAILURE_HARD_LIMIT") {
                Ok(v) => v.parse()?,
                Err(_) => defaults.failure_hard_limit,
            },
            max_concurrent_templates: match std::env::var(
                "PREWARM_PREBUILDS_MAX_CONCURRENT_TEMPLATES",
            ) {
                Ok(v) => v.parse()?,
                Err(_) => defaults.max_concurrent_templates,
            },
        })
    }

    /// The tick interval, never zero.
    pub fn effective_interval(&self) -> Duration {
        if self.reconciliation_interval.is_zero() {
            FALLBACK_RECONCILIATION_INTERVAL
        } else {
            self.reconciliation_interval
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => Ok(Duration::from_secs(v.parse()?)),
        Err(_) => Ok(default),
    }
}

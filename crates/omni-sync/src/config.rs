//! # Engine Configuration
//!
//! TOML-backed engine settings with environment overrides.
//!
//! ## Configuration File Format
//! ```toml
//! # omnisync.toml
//! [database]
//! path = "omnisync.db"
//!
//! [workers]
//! stock = 2
//! order = 2
//! push = 4
//! notification = 1
//!
//! [retry]
//! base_backoff_secs = 5
//! max_backoff_secs = 300
//!
//! [scheduler]
//! order_pull_interval_secs = 60
//! stall_check_interval_secs = 30
//! stall_timeout_secs = 120
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use omni_core::QueueName;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Database Settings
// =============================================================================

/// Database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file path.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Maximum pool connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> String {
    "omnisync.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Worker Settings
// =============================================================================

/// Worker counts per queue.
///
/// Queues are sized by workload shape: pushes are numerous and short, order
/// pulls are rate-sensitive and capped low, notifications are best-effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_stock_workers")]
    pub stock: usize,

    #[serde(default = "default_order_workers")]
    pub order: usize,

    #[serde(default = "default_push_workers")]
    pub push: usize,

    #[serde(default = "default_notification_workers")]
    pub notification: usize,
}

fn default_stock_workers() -> usize {
    2
}
fn default_order_workers() -> usize {
    2
}
fn default_push_workers() -> usize {
    4
}
fn default_notification_workers() -> usize {
    1
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            stock: default_stock_workers(),
            order: default_order_workers(),
            push: default_push_workers(),
            notification: default_notification_workers(),
        }
    }
}

impl WorkerSettings {
    /// Worker count for one queue.
    pub fn count_for(&self, queue: QueueName) -> usize {
        match queue {
            QueueName::Stock => self.stock,
            QueueName::Order => self.order,
            QueueName::Push => self.push,
            QueueName::Notification => self.notification,
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Backoff parameters for transient-failure retries.
///
/// Delay for attempt n is `base * 2^n` seconds plus a random jitter of up
/// to one base interval, capped at `max_backoff_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Default attempt budget for jobs that do not override it.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: i64,

    /// Per-attempt handler execution deadline.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
}

fn default_base_backoff() -> u64 {
    5
}
fn default_max_backoff() -> u64 {
    300
}
fn default_max_attempts() -> i64 {
    3
}
fn default_job_timeout() -> u64 {
    60
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            base_backoff_secs: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
            default_max_attempts: default_max_attempts(),
            job_timeout_secs: default_job_timeout(),
        }
    }
}

// =============================================================================
// Scheduler Settings
// =============================================================================

/// Periodic task intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// How often order pulls are scheduled per connected account (seconds).
    #[serde(default = "default_order_pull_interval")]
    pub order_pull_interval_secs: u64,

    /// How often the stall scanner runs (seconds).
    #[serde(default = "default_stall_check_interval")]
    pub stall_check_interval_secs: u64,

    /// Heartbeat silence after which an active job counts as stalled.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,

    /// Worker poll interval when a queue is empty (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_order_pull_interval() -> u64 {
    60
}
fn default_stall_check_interval() -> u64 {
    30
}
fn default_stall_timeout() -> u64 {
    120
}
fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            order_pull_interval_secs: default_order_pull_interval(),
            stall_check_interval_secs: default_stall_check_interval(),
            stall_timeout_secs: default_stall_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub workers: WorkerSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

impl EngineConfig {
    /// Loads configuration from a TOML file, falling back to defaults when
    /// the file is absent. Environment overrides apply last.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.retry.base_backoff_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "base_backoff_secs must be greater than 0".into(),
            ));
        }
        if self.retry.max_backoff_secs < self.retry.base_backoff_secs {
            return Err(SyncError::InvalidConfig(
                "max_backoff_secs must be >= base_backoff_secs".into(),
            ));
        }
        if self.retry.default_max_attempts < 1 {
            return Err(SyncError::InvalidConfig(
                "default_max_attempts must be at least 1".into(),
            ));
        }
        if self.workers.stock == 0
            || self.workers.order == 0
            || self.workers.push == 0
            || self.workers.notification == 0
        {
            return Err(SyncError::InvalidConfig(
                "every queue needs at least one worker".into(),
            ));
        }
        // Workers heartbeat every stall_timeout_secs / 3 while a job runs; a
        // zero window would let the scanner reclaim a job mid-heartbeat.
        if self.scheduler.stall_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "stall_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("OMNISYNC_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = path;
        }

        if let Ok(interval) = std::env::var("OMNISYNC_ORDER_PULL_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.scheduler.order_pull_interval_secs = secs;
            }
        }
    }
}

//! # Sync Error Types
//!
//! Error taxonomy for the engine. Every channel-facing failure falls into
//! one category, and the category alone decides what the backlog does next.
//!
//! ## Failure Handling Matrix
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Failure Category → Backlog Action                   │
//! │                                                                         │
//! │  Auth           terminal, no retry, account flagged Error               │
//! │  RateLimited    rescheduled after the window, attempt NOT counted       │
//! │  Transient      retried with exponential backoff, attempt counted       │
//! │  Rejected       terminal, no retry (channel refused the data)           │
//! │  RuleEvaluation isolated per rule, other rules still run                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Engine error type covering channel, storage, and internal failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Channel Errors (the retry taxonomy)
    // =========================================================================
    /// Credentials rejected by the channel. Terminal for the job and for
    /// the account until the merchant re-authenticates.
    #[error("Channel authentication failed for account {account_id}: {detail}")]
    Auth { account_id: String, detail: String },

    /// The channel's rate limit fired despite the governor (shared quota,
    /// clock skew). The job is rescheduled without consuming an attempt.
    #[error("Rate limited by channel, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Recoverable channel failure (network error, 5xx, timeout).
    #[error("Transient channel error: {0}")]
    Transient(String),

    /// The channel understood the request and refused it (unknown SKU,
    /// validation failure). Retrying the same payload cannot succeed.
    #[error("Channel rejected request: {0}")]
    Rejected(String),

    /// A sync rule failed to evaluate (bad custom formula, missing data).
    /// Isolated per rule; other rules proceed.
    #[error("Rule {rule_id} evaluation failed: {reason}")]
    RuleEvaluation { rule_id: String, reason: String },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// No adapter registered for a channel code.
    #[error("No channel adapter registered for '{0}'")]
    ChannelNotRegistered(String),

    /// Handler exceeded its execution deadline.
    #[error("Job timed out after {0} seconds")]
    Timeout(u64),

    /// No handler registered for a job kind.
    #[error("No handler registered for job kind '{0}'")]
    HandlerNotRegistered(String),

    /// Engine is shutting down; no new work accepted.
    #[error("Sync engine is shutting down")]
    ShuttingDown,

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid engine configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Failed to load the config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// Durable storage failure.
    #[error("Store error: {0}")]
    Store(#[from] omni_store::StoreError),

    /// Job payload or event serialization failure.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Domain-level failure from omni-core.
    #[error("Core error: {0}")]
    Core(#[from] omni_core::CoreError),
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<omni_core::ValidationError> for SyncError {
    fn from(err: omni_core::ValidationError) -> Self {
        SyncError::Core(err.into())
    }
}

// =============================================================================
// Error Categorization (drives the backlog)
// =============================================================================

impl SyncError {
    /// Whether the backlog should schedule another attempt.
    ///
    /// Store errors are treated as transient: SQLite contention and disk
    /// hiccups resolve themselves, and losing a push over one is worse than
    /// retrying it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. }
                | SyncError::Transient(_)
                | SyncError::Timeout(_)
                | SyncError::Store(_)
        )
    }

    /// Whether the failed execution consumes one of the job's attempts.
    ///
    /// A governor denial means no channel call happened, so nothing was
    /// actually attempted.
    pub fn counts_attempt(&self) -> bool {
        !matches!(self, SyncError::RateLimited { .. })
    }

    /// Whether this failure should flag the account's connection state.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SyncError::Auth { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(SyncError::Transient("connection reset".into()).is_retryable());
        assert!(SyncError::RateLimited { retry_after_secs: 30 }.is_retryable());
        assert!(SyncError::Timeout(60).is_retryable());

        assert!(!SyncError::Rejected("unknown sku".into()).is_retryable());
        assert!(!SyncError::Auth {
            account_id: "acc-1".into(),
            detail: "token expired".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_validation_error_wraps_as_core() {
        let err: SyncError = omni_core::ValidationError::NoTargets.into();
        assert!(matches!(
            err,
            SyncError::Core(omni_core::CoreError::Validation(_))
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rate_limit_does_not_count_attempt() {
        assert!(!SyncError::RateLimited { retry_after_secs: 30 }.counts_attempt());
        assert!(SyncError::Transient("x".into()).counts_attempt());
        assert!(SyncError::Rejected("x".into()).counts_attempt());
    }
}

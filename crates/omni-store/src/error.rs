//! # Store Error Types
//!
//! Error types for database operations.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Database operation failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open or connect to the database.
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Database error: {0}")]
    Query(String),

    /// A row contained data that no longer decodes (enum string drift,
    /// malformed JSON column).
    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: String, reason: String },

    /// Entity lookup by id found nothing.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },
}

impl StoreError {
    /// Builds a corrupt-row error for enum/JSON column decoding failures.
    pub fn corrupt(table: &str, reason: impl Into<String>) -> Self {
        StoreError::CorruptRow {
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Query(format!("JSON column: {err}"))
    }
}

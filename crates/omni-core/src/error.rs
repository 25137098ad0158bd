//! # Error Types
//!
//! Domain-specific error types for omni-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  omni-core errors (this file)                                           │
//! │  ├── CoreError        - Domain rule violations                          │
//! │  └── ValidationError  - Input validation failures                       │
//! │                                                                         │
//! │  omni-store errors (separate crate)                                     │
//! │  └── StoreError       - Database operation failures                     │
//! │                                                                         │
//! │  omni-sync errors (separate crate)                                      │
//! │  └── SyncError        - Channel/retry taxonomy seen by the engine       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (product ref, rule id, etc.)
//! 3. Errors are enum variants, never String

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
///
/// These represent business rule violations in pure logic. Transport and
/// storage failures live in their own crates.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Inventory record cannot be found.
    #[error("Inventory record not found: {0}")]
    InventoryNotFound(String),

    /// Channel account cannot be found.
    #[error("Channel account not found: {0}")]
    AccountNotFound(String),

    /// A sync rule failed to produce a target quantity.
    ///
    /// Isolated per rule: sibling rules for the same product still run.
    #[error("Rule {rule_id} evaluation failed: {reason}")]
    RuleEvaluation { rule_id: String, reason: String },

    /// An order status transition is not on the canonical graph.
    ///
    /// Recorded for audit, flagged anomalous, never silently dropped.
    #[error("Anomalous order transition: {from} -> {to}")]
    AnomalousTransition { from: String, to: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// Used for early validation of merchant-supplied configuration (sync rules,
/// rate profiles) before it reaches the engine.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., unparseable expression).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// A rule must name at least one target account.
    #[error("Sync rule must target at least one channel account")]
    NoTargets,
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

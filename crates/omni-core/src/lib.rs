//! # omni-core: Domain Logic for Omnisync
//!
//! Pure business logic for multi-channel inventory and order synchronization.
//! No I/O, no async, no database: everything here is deterministic and unit
//! testable.
//!
//! ## Module Organization
//! - [`types`] - Accounts, inventory records, orders, jobs, ledger entries
//! - [`rules`] - Sync rules: scope matching and target quantity strategies
//! - [`expr`] - Sandboxed expression evaluator for custom strategies
//! - [`status`] - Canonical order lifecycle graph and per-channel status maps
//! - [`error`] - Domain and validation error types
//!
//! ## Layering
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  omni-sync (engine)      workers, governor, channel adapters            │
//! │       │                                                                 │
//! │  omni-store (sqlx)       persistence for everything defined here        │
//! │       │                                                                 │
//! │  omni-core (THIS CRATE)  the vocabulary both layers share               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod expr;
pub mod rules;
pub mod status;
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use expr::{Expr, ExprError};
pub use rules::{RuleScope, SyncRule, SyncStrategy};
pub use status::{classify_transition, CanonicalStatus, ChannelStatus, StatusMap, TransitionClass};
pub use types::{
    AutomationAction, AutomationRule, ChannelAccount, ConnectionState, InventoryRecord, JobKind,
    JobStatus, LedgerEntry, Order, OrderItem, QueueName, RateLimitProfile, StatusTransition,
    SyncJob, SyncStats,
};

/// Generates a new UUID v4 string identifier.
///
/// All entities use string UUIDs so ids stay portable across the SQLite
/// store and channel payloads.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

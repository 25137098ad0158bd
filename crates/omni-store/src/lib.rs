//! # omni-store: SQLite Persistence for Omnisync
//!
//! The engine's durable collaborator: transactional read-modify-write on
//! inventory records, the persistent job backlog that survives process
//! restart, the append-only sync ledger, canonical orders, and merchant
//! configuration.
//!
//! ## Module Organization
//! - [`pool`] - Connection pool + `Database` handle with repository accessors
//! - [`migrations`] - Embedded schema migrations
//! - [`repository`] - One repository per aggregate
//! - [`error`] - Store error types
//!
//! ## Conventions
//! - Timestamps: RFC3339 TEXT columns decoded as `chrono::DateTime<Utc>`
//! - Enums: snake_case strings (`omni_core` owns parse/format)
//! - Structured config (strategies, scopes, actions): JSON TEXT columns
//! - Queries: runtime-checked `sqlx::query` (no compile-time macros, so the
//!   workspace builds without a database present)

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{StoreError, StoreResult};
pub use pool::{Database, DbConfig};
pub use repository::job::EnqueueOptions;
pub use repository::ledger::LedgerFilter;
pub use repository::order::OrderUpsert;

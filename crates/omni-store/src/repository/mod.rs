//! # Repository Layer
//!
//! One repository per aggregate. Each repository owns a pool clone and is
//! cheap to construct from [`crate::Database`]'s accessor methods.
//!
//! ## Repositories
//! - [`account`] - Channel accounts (connect state, rate profiles)
//! - [`inventory`] - Stock positions with transactional adjustments
//! - [`rule`] - Sync rules (read-only at evaluation time)
//! - [`automation`] - Tag/assign automation rules
//! - [`job`] - The durable job backlog (enqueue/claim/retry/stall)
//! - [`ledger`] - Append-only attempt audit trail + aggregate stats
//! - [`order`] - Canonical orders with idempotent channel upserts
//! - [`push_state`] - Last pushed quantity per (product, account)

pub mod account;
pub mod automation;
pub mod inventory;
pub mod job;
pub mod ledger;
pub mod order;
pub mod push_state;
pub mod rule;

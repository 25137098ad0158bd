//! # omni-sync
//!
//! The synchronization engine: channel adapters, the rate governor, the
//! durable job backlog, stock and order sync handlers, and the orchestrating
//! [`SyncEngine`].
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             SyncEngine                                  │
//! │                                                                         │
//! │   inventory change ──► StockSync (rules) ──► push jobs ─┐               │
//! │   pull scheduler ───► order pull jobs ──────────────────┤               │
//! │                                                         ▼               │
//! │                                                   JobBacklog            │
//! │                                              (workers + retries)        │
//! │                                                         │               │
//! │                                     RateGovernor ◄──────┤               │
//! │                                                         ▼               │
//! │                                             ChannelAdapter impls        │
//! │                                                         │               │
//! │                  sync ledger ◄── every executed attempt ┘               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod adapter;
pub mod backlog;
pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod governor;
pub mod orders;
pub mod stock;

pub use adapter::{ChannelAdapter, ChannelOrder, ChannelProduct, ChannelRegistry};
pub use backlog::{JobBacklog, JobHandler, LedgerContext};
pub use config::EngineConfig;
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use events::{CollectingSink, EventSink, SyncEvent, TracingSink};
pub use governor::{OpClass, RateGovernor};

//! # Engine Events
//!
//! Best-effort notifications emitted by the engine. Events ride the
//! notification queue as single-attempt jobs: delivery failure is logged
//! and dropped, never retried, and never blocks sync work.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use omni_core::{JobKind, SyncJob};

use crate::backlog::{JobHandler, LedgerContext};
use crate::error::SyncResult;

// =============================================================================
// Events
// =============================================================================

/// Everything the engine announces to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A stock push reached the channel.
    StockPushed {
        product_ref: String,
        account_id: String,
        quantity: i64,
    },

    /// Available stock fell to or below the alert threshold.
    LowStockAlert {
        product_ref: String,
        available: i64,
        min_threshold: i64,
    },

    /// A new order arrived from a channel.
    OrderReceived {
        order_id: String,
        channel_code: String,
        channel_order_id: String,
    },

    /// A channel reported a status the adapter could not map.
    OrderNeedsReview {
        order_id: String,
        channel_code: String,
        native_status: String,
    },
}

// =============================================================================
// Sink
// =============================================================================

/// Delivery target for events (log line, webhook, message bus).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &SyncEvent) -> SyncResult<()>;
}

/// Sink that writes events to the log. The daemon's default.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn deliver(&self, event: &SyncEvent) -> SyncResult<()> {
        info!(event = ?event, "Sync event");
        Ok(())
    }
}

/// Sink that records events in memory, for tests.
#[derive(Default)]
pub struct CollectingSink {
    events: std::sync::Mutex<Vec<SyncEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn deliver(&self, event: &SyncEvent) -> SyncResult<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Delivers one event per [`JobKind::Notify`] job.
pub struct NotifyHandler {
    sink: Arc<dyn EventSink>,
}

impl NotifyHandler {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        NotifyHandler { sink }
    }
}

#[async_trait]
impl JobHandler for NotifyHandler {
    fn kind(&self) -> JobKind {
        JobKind::Notify
    }

    fn describe(&self, _job: &SyncJob) -> LedgerContext {
        LedgerContext::default()
    }

    async fn execute(&self, job: &SyncJob) -> SyncResult<()> {
        let event: SyncEvent = serde_json::from_str(&job.payload)?;
        self.sink.deliver(&event).await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

//! # Order Sync
//!
//! Pulls orders from channels, maps native statuses onto the canonical
//! lifecycle, and feeds confirmed orders back into inventory.
//!
//! ## Pull Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  SyncOrders Job for account A                           │
//! │                                                                         │
//! │   governor(Read) ──► adapter.fetch_orders(A, since = last_synced_at)    │
//! │                               │                                         │
//! │                    for each channel order:                              │
//! │                               │                                         │
//! │           status_map.resolve(native_status)                             │
//! │             ├── Known(s)  ──► upsert (classified transition)            │
//! │             │                   └── first Confirmed ──► ProcessOrder    │
//! │             │                       job + automation rules              │
//! │             └── Unmapped  ──► upsert as needs_review, status held       │
//! │                               at Pending for new orders                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ProcessOrder decrements inventory once per order (the upsert's
//! `confirmed_now` fires at most once) and re-evaluates stock rules for the
//! affected products, so a channel sale propagates to every other channel.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use omni_core::{new_id, AutomationAction, CanonicalStatus, ChannelStatus, JobKind, Order};
use omni_store::{Database, EnqueueOptions, StoreError};

use crate::adapter::{ChannelOrder, ChannelRegistry};
use crate::backlog::{JobHandler, LedgerContext};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::governor::{OpClass, RateGovernor};
use crate::stock::SyncStockPayload;

// =============================================================================
// Payloads
// =============================================================================

/// Payload for [`JobKind::SyncOrders`] jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOrdersPayload {
    pub account_id: String,
}

/// Dedup key for order pulls: one queued pull per account.
pub fn pull_dedup_key(account_id: &str) -> String {
    format!("orders:{account_id}")
}

/// Payload for [`JobKind::ProcessOrder`] jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOrderPayload {
    pub order_id: String,
    pub account_id: String,
}

/// Payload for [`JobKind::ReportStatus`] jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStatusPayload {
    pub order_id: String,
    pub account_id: String,
    pub status: CanonicalStatus,
}

/// Dedup key for status reports: coalescing on the order id means the
/// latest queued status wins when the merchant changes it twice quickly.
pub fn report_dedup_key(order_id: &str) -> String {
    format!("report:{order_id}")
}

// =============================================================================
// Pull Handler
// =============================================================================

/// Pulls one account's orders and applies them.
pub struct SyncOrdersHandler {
    db: Arc<Database>,
    registry: Arc<ChannelRegistry>,
    governor: Arc<RateGovernor>,
}

impl SyncOrdersHandler {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<ChannelRegistry>,
        governor: Arc<RateGovernor>,
    ) -> Self {
        SyncOrdersHandler {
            db,
            registry,
            governor,
        }
    }

    async fn apply_order(
        &self,
        account: &omni_core::ChannelAccount,
        channel_order: &ChannelOrder,
        resolved: ChannelStatus,
    ) -> SyncResult<()> {
        let actor = format!("channel:{}", account.channel_code);

        let (status, needs_review) = match resolved {
            ChannelStatus::Known(status) => (status, false),
            ChannelStatus::Unmapped(ref native) => {
                warn!(
                    channel_order_id = %channel_order.channel_order_id,
                    native_status = %native,
                    "Unmapped channel status, order flagged for review"
                );
                // Hold new orders at Pending; for existing orders the upsert
                // keeps the stored status because Pending never advances it
                // forward and an anomalous write is avoided below.
                match self
                    .db
                    .orders()
                    .get_by_channel(&account.id, &channel_order.channel_order_id)
                    .await?
                {
                    Some(existing) => {
                        self.db.orders().set_needs_review(&existing.id, true).await?;
                        self.emit_review_event(&existing.id, account, native).await?;
                        return Ok(());
                    }
                    None => (CanonicalStatus::Pending, true),
                }
            }
        };

        let candidate = Order {
            id: new_id(),
            account_id: account.id.clone(),
            channel_code: account.channel_code.clone(),
            channel_order_id: channel_order.channel_order_id.clone(),
            status,
            needs_review,
            assigned_to: None,
            tags: vec![],
            items: channel_order.items.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let result = self
            .db
            .orders()
            .upsert(&candidate, &actor, Some(&channel_order.native_status))
            .await?;

        if result.created {
            let event = SyncEvent::OrderReceived {
                order_id: result.order.id.clone(),
                channel_code: account.channel_code.clone(),
                channel_order_id: channel_order.channel_order_id.clone(),
            };
            self.db
                .jobs()
                .enqueue(
                    EnqueueOptions::new(JobKind::Notify, serde_json::to_string(&event)?)
                        .max_attempts(1),
                )
                .await?;
        }

        if needs_review {
            self.emit_review_event(&result.order.id, account, &channel_order.native_status)
                .await?;
        }

        if result.confirmed_now {
            let payload = serde_json::to_string(&ProcessOrderPayload {
                order_id: result.order.id.clone(),
                account_id: account.id.clone(),
            })?;
            self.db
                .jobs()
                .enqueue(
                    EnqueueOptions::new(JobKind::ProcessOrder, payload)
                        .dedup_key(format!("process:{}", result.order.id)),
                )
                .await?;
        }

        self.apply_automation(&result.order).await?;
        Ok(())
    }

    async fn emit_review_event(
        &self,
        order_id: &str,
        account: &omni_core::ChannelAccount,
        native_status: &str,
    ) -> SyncResult<()> {
        let event = SyncEvent::OrderNeedsReview {
            order_id: order_id.to_string(),
            channel_code: account.channel_code.clone(),
            native_status: native_status.to_string(),
        };
        self.db
            .jobs()
            .enqueue(
                EnqueueOptions::new(JobKind::Notify, serde_json::to_string(&event)?)
                    .max_attempts(1),
            )
            .await?;
        Ok(())
    }

    /// Applies active automation rules to a freshly written order. Each
    /// rule's failure is isolated.
    async fn apply_automation(&self, order: &Order) -> SyncResult<()> {
        let rules = self.db.automation().list_active().await?;
        for rule in rules.iter().filter(|r| r.matches(order)) {
            let applied = match &rule.action {
                AutomationAction::AddTag(tag) => {
                    let mut tags = order.tags.clone();
                    if tags.iter().any(|t| t == tag) {
                        continue;
                    }
                    tags.push(tag.clone());
                    self.db.orders().set_tags(&order.id, &tags).await
                }
                AutomationAction::Assign(user) => self.db.orders().assign(&order.id, user).await,
            };
            if let Err(e) = applied {
                warn!(rule_id = %rule.id, order_id = %order.id, error = %e, "Automation rule failed");
            } else {
                debug!(rule_id = %rule.id, order_id = %order.id, "Automation rule applied");
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobHandler for SyncOrdersHandler {
    fn kind(&self) -> JobKind {
        JobKind::SyncOrders
    }

    fn describe(&self, job: &omni_core::SyncJob) -> LedgerContext {
        let payload: Option<SyncOrdersPayload> = serde_json::from_str(&job.payload).ok();
        LedgerContext {
            account_id: payload.map(|p| p.account_id),
            ..Default::default()
        }
    }

    async fn execute(&self, job: &omni_core::SyncJob) -> SyncResult<()> {
        let payload: SyncOrdersPayload = serde_json::from_str(&job.payload)?;
        let account = self.db.accounts().get(&payload.account_id).await?;
        if !account.is_syncable() {
            debug!(account_id = %account.id, "Skipping pull for non-syncable account");
            return Ok(());
        }

        // Denials park the job rather than holding the order worker.
        self.governor
            .try_acquire(&account, OpClass::Read)
            .await
            .map_err(|retry_after_secs| SyncError::RateLimited { retry_after_secs })?;

        let adapter = self.registry.get(&account.channel_code)?;
        let orders = adapter
            .fetch_orders(&account, account.last_synced_at)
            .await?;

        info!(
            account_id = %account.id,
            channel = %account.channel_code,
            count = orders.len(),
            "Pulled channel orders"
        );

        for channel_order in &orders {
            let resolved = adapter.status_map().resolve(&channel_order.native_status);
            self.apply_order(&account, channel_order, resolved).await?;
        }

        self.db
            .accounts()
            .set_last_synced(&account.id, Utc::now())
            .await?;
        Ok(())
    }
}

// =============================================================================
// Process Handler
// =============================================================================

/// Applies inventory feedback for a newly confirmed order, then re-runs the
/// stock rules for the affected products.
pub struct ProcessOrderHandler {
    db: Arc<Database>,
}

impl ProcessOrderHandler {
    pub fn new(db: Arc<Database>) -> Self {
        ProcessOrderHandler { db }
    }
}

#[async_trait::async_trait]
impl JobHandler for ProcessOrderHandler {
    fn kind(&self) -> JobKind {
        JobKind::ProcessOrder
    }

    fn describe(&self, job: &omni_core::SyncJob) -> LedgerContext {
        let payload: Option<ProcessOrderPayload> = serde_json::from_str(&job.payload).ok();
        LedgerContext {
            account_id: payload.map(|p| p.account_id),
            ..Default::default()
        }
    }

    async fn execute(&self, job: &omni_core::SyncJob) -> SyncResult<()> {
        let payload: ProcessOrderPayload = serde_json::from_str(&job.payload)?;
        let order = self.db.orders().get(&payload.order_id).await?;

        for item in &order.items {
            match self
                .db
                .inventory()
                .adjust(&item.product_ref, -item.quantity)
                .await
            {
                Ok(record) => {
                    debug!(
                        order_id = %order.id,
                        product_ref = %item.product_ref,
                        quantity = record.quantity,
                        "Decremented inventory for confirmed order"
                    );
                }
                Err(StoreError::NotFound { .. }) => {
                    // Channel sold something we do not track. Skip the item
                    // rather than fail the whole order.
                    warn!(
                        order_id = %order.id,
                        product_ref = %item.product_ref,
                        "Order references untracked product"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            // Propagate the new level to the other channels.
            let payload = serde_json::to_string(&SyncStockPayload {
                product_ref: item.product_ref.clone(),
                reason: format!("order:{}", order.channel_order_id),
            })?;
            self.db
                .jobs()
                .enqueue(
                    EnqueueOptions::new(JobKind::SyncStock, payload)
                        .dedup_key(format!("sync_stock:{}", item.product_ref)),
                )
                .await?;
        }

        Ok(())
    }
}

// =============================================================================
// Report Handler
// =============================================================================

/// Reports a merchant-made status change back to the order's channel.
///
/// Runs on the backlog like every other channel call, so a governor denial
/// or transient failure parks or retries the report instead of losing it.
pub struct ReportStatusHandler {
    db: Arc<Database>,
    registry: Arc<ChannelRegistry>,
    governor: Arc<RateGovernor>,
}

impl ReportStatusHandler {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<ChannelRegistry>,
        governor: Arc<RateGovernor>,
    ) -> Self {
        ReportStatusHandler {
            db,
            registry,
            governor,
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for ReportStatusHandler {
    fn kind(&self) -> JobKind {
        JobKind::ReportStatus
    }

    fn describe(&self, job: &omni_core::SyncJob) -> LedgerContext {
        let payload: Option<ReportStatusPayload> = serde_json::from_str(&job.payload).ok();
        LedgerContext {
            account_id: payload.map(|p| p.account_id),
            ..Default::default()
        }
    }

    async fn execute(&self, job: &omni_core::SyncJob) -> SyncResult<()> {
        let payload: ReportStatusPayload = serde_json::from_str(&job.payload)?;
        let order = self.db.orders().get(&payload.order_id).await?;
        let account = self.db.accounts().get(&payload.account_id).await?;
        if !account.is_syncable() {
            debug!(account_id = %account.id, "Skipping status report for non-syncable account");
            return Ok(());
        }

        self.governor
            .try_acquire(&account, OpClass::Write)
            .await
            .map_err(|retry_after_secs| SyncError::RateLimited { retry_after_secs })?;

        let adapter = self.registry.get(&account.channel_code)?;
        adapter
            .update_order_status(&account, &order.channel_order_id, payload.status)
            .await?;

        info!(
            order_id = %order.id,
            channel = %account.channel_code,
            status = %payload.status,
            "Reported status change to channel"
        );
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

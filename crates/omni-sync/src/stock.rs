//! # Stock Sync
//!
//! Turns one inventory change into per-target push jobs by running the
//! merchant's sync rules.
//!
//! ## Evaluation Fan-Out
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   SyncStock Job for product P                           │
//! │                                                                         │
//! │   load inventory(P) ──► active rules ──► rules whose scope matches P    │
//! │                                              │                          │
//! │                 ┌────────────────────────────┼──────────────┐           │
//! │                 ▼                            ▼              ▼           │
//! │             rule A (EXACT)            rule B (PCT 50)   rule C (bad)    │
//! │             targets acc-1, acc-2      targets acc-3     formula error   │
//! │                 │                            │              │           │
//! │                 ▼                            ▼              ▼           │
//! │        PushStockTarget jobs          PushStockTarget   logged, others   │
//! │        dedup_key = "P:acc-N"         dedup_key="P:acc-3"  unaffected    │
//! │                                                                         │
//! │   One queued push per (product, account): re-evaluating while a push    │
//! │   is still queued refreshes it instead of stacking a second one.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use omni_core::JobKind;
use omni_store::{Database, EnqueueOptions};

use crate::adapter::ChannelRegistry;
use crate::backlog::{JobHandler, LedgerContext};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::governor::{OpClass, RateGovernor};

// =============================================================================
// Payloads
// =============================================================================

/// Payload for [`JobKind::SyncStock`] jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStockPayload {
    pub product_ref: String,
    /// What caused the evaluation ("manual_edit", "order:SM-1001", ...).
    pub reason: String,
}

/// Payload for [`JobKind::PushStockTarget`] jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushStockPayload {
    pub product_ref: String,
    pub account_id: String,
    /// Quantity computed by the rule at evaluation time.
    pub quantity: i64,
    /// Rule that produced this push, for the audit trail.
    pub rule_id: String,
}

/// Dedup key for a push target: at most one queued push per pair.
pub fn push_dedup_key(product_ref: &str, account_id: &str) -> String {
    format!("{product_ref}:{account_id}")
}

// =============================================================================
// Stock Sync
// =============================================================================

/// Rule evaluation over inventory changes.
pub struct StockSync {
    db: Arc<Database>,
    default_max_attempts: i64,
}

impl StockSync {
    pub fn new(db: Arc<Database>, default_max_attempts: i64) -> Self {
        StockSync {
            db,
            default_max_attempts,
        }
    }

    /// Runs every active rule against one product and enqueues push jobs
    /// for the targets. A rule that fails to evaluate is logged and skipped;
    /// the remaining rules still run. Returns the enqueued job ids.
    pub async fn evaluate(&self, product_ref: &str, reason: &str) -> SyncResult<Vec<String>> {
        let record = self.db.inventory().get(product_ref).await?;
        let rules = self.db.rules().list_active().await?;

        let mut job_ids = Vec::new();
        for rule in &rules {
            if !rule.matches(&record) {
                continue;
            }

            for account_id in &rule.target_accounts {
                let account = match self.db.accounts().get(account_id).await {
                    Ok(account) => account,
                    Err(e) => {
                        warn!(rule_id = %rule.id, account_id = %account_id, error = %e, "Rule targets unknown account");
                        continue;
                    }
                };
                if !account.is_syncable() {
                    debug!(account_id = %account_id, "Skipping non-syncable account");
                    continue;
                }

                let last_pushed = self
                    .db
                    .push_state()
                    .last_pushed(product_ref, account_id)
                    .await?;

                let target = match rule.target_quantity(record.quantity, last_pushed, &record) {
                    Ok(target) => target,
                    Err(e) => {
                        // Per-rule isolation: a bad formula must not block
                        // the other rules.
                        warn!(rule_id = %rule.id, error = %e, "Rule evaluation failed");
                        break;
                    }
                };

                let Some(quantity) = target else {
                    debug!(
                        rule_id = %rule.id,
                        account_id = %account_id,
                        "Change below rule threshold, push suppressed"
                    );
                    continue;
                };

                let payload = serde_json::to_string(&PushStockPayload {
                    product_ref: product_ref.to_string(),
                    account_id: account_id.clone(),
                    quantity,
                    rule_id: rule.id.clone(),
                })?;

                let job_id = self
                    .db
                    .jobs()
                    .enqueue(
                        EnqueueOptions::new(JobKind::PushStockTarget, payload)
                            .max_attempts(self.default_max_attempts)
                            .dedup_key(push_dedup_key(product_ref, account_id)),
                    )
                    .await?;
                job_ids.push(job_id);
            }
        }

        if record.is_low_stock() {
            let event = SyncEvent::LowStockAlert {
                product_ref: record.product_ref.clone(),
                available: record.available(),
                min_threshold: record.min_threshold,
            };
            self.db
                .jobs()
                .enqueue(
                    EnqueueOptions::new(JobKind::Notify, serde_json::to_string(&event)?)
                        .max_attempts(1)
                        .dedup_key(format!("low_stock:{product_ref}")),
                )
                .await?;
        }

        info!(
            product_ref = %product_ref,
            reason = %reason,
            pushes = job_ids.len(),
            "Evaluated stock change"
        );
        Ok(job_ids)
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Runs rule evaluation for [`JobKind::SyncStock`] jobs.
pub struct SyncStockHandler {
    stock: Arc<StockSync>,
}

impl SyncStockHandler {
    pub fn new(stock: Arc<StockSync>) -> Self {
        SyncStockHandler { stock }
    }
}

#[async_trait::async_trait]
impl JobHandler for SyncStockHandler {
    fn kind(&self) -> JobKind {
        JobKind::SyncStock
    }

    fn describe(&self, job: &omni_core::SyncJob) -> LedgerContext {
        let payload: Option<SyncStockPayload> = serde_json::from_str(&job.payload).ok();
        LedgerContext {
            product_ref: payload.map(|p| p.product_ref),
            ..Default::default()
        }
    }

    async fn execute(&self, job: &omni_core::SyncJob) -> SyncResult<()> {
        let payload: SyncStockPayload = serde_json::from_str(&job.payload)?;
        self.stock
            .evaluate(&payload.product_ref, &payload.reason)
            .await?;
        Ok(())
    }
}

/// Pushes one quantity to one channel account for
/// [`JobKind::PushStockTarget`] jobs.
pub struct PushStockHandler {
    db: Arc<Database>,
    registry: Arc<ChannelRegistry>,
    governor: Arc<RateGovernor>,
}

impl PushStockHandler {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<ChannelRegistry>,
        governor: Arc<RateGovernor>,
    ) -> Self {
        PushStockHandler {
            db,
            registry,
            governor,
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for PushStockHandler {
    fn kind(&self) -> JobKind {
        JobKind::PushStockTarget
    }

    fn describe(&self, job: &omni_core::SyncJob) -> LedgerContext {
        match serde_json::from_str::<PushStockPayload>(&job.payload) {
            Ok(p) => LedgerContext {
                account_id: Some(p.account_id),
                product_ref: Some(p.product_ref),
                quantity: Some(p.quantity),
            },
            Err(_) => LedgerContext::default(),
        }
    }

    async fn execute(&self, job: &omni_core::SyncJob) -> SyncResult<()> {
        let payload: PushStockPayload = serde_json::from_str(&job.payload)?;

        let account = self.db.accounts().get(&payload.account_id).await?;
        if !account.is_syncable() {
            // The account was disabled between evaluation and execution.
            return Err(SyncError::Rejected(format!(
                "account {} is not syncable",
                account.id
            )));
        }

        // Slot first: a denial here means no channel call happened. Workers
        // never wait on the governor; a denied job is parked instead.
        self.governor
            .try_acquire(&account, OpClass::Write)
            .await
            .map_err(|retry_after_secs| SyncError::RateLimited { retry_after_secs })?;

        let adapter = self.registry.get(&account.channel_code)?;
        adapter
            .push_stock(&account, &payload.product_ref, payload.quantity)
            .await?;

        self.db
            .push_state()
            .record(&payload.product_ref, &payload.account_id, payload.quantity)
            .await?;
        self.db
            .accounts()
            .set_last_synced(&account.id, Utc::now())
            .await?;

        let event = SyncEvent::StockPushed {
            product_ref: payload.product_ref.clone(),
            account_id: payload.account_id.clone(),
            quantity: payload.quantity,
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
}

// =============================================================================
// Unit Tests
// =============================================================================

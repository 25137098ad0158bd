//! # Sync Engine
//!
//! The orchestrator. Owns the registry, governor, and backlog, wires the
//! handlers together, and runs the periodic order-pull scheduler. Everything
//! the daemon (or an embedding application) talks to goes through here.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncEngine Lifecycle                             │
//! │                                                                         │
//! │   SyncEngine::new(db, config, registry, sink)                           │
//! │        │  builds governor + backlog, registers every job handler        │
//! │        ▼                                                                │
//! │   engine.start()                                                        │
//! │        │  spawns queue workers, stall scanner, order-pull scheduler     │
//! │        ▼                                                                │
//! │   ... trigger_sync() / connect_account() / get_sync_stats() ...         │
//! │        ▼                                                                │
//! │   engine.shutdown().await                                               │
//! │        flips the watch channel, workers finish in-flight jobs and exit  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use omni_core::{
    new_id, CanonicalStatus, ChannelAccount, ConnectionState, JobKind, JobStatus, LedgerEntry,
    Order, RateLimitProfile, SyncRule, SyncStats,
};
use omni_store::{Database, EnqueueOptions, LedgerFilter};

use crate::adapter::ChannelRegistry;
use crate::backlog::JobBacklog;
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventSink, NotifyHandler};
use crate::governor::RateGovernor;
use crate::orders::{
    pull_dedup_key, report_dedup_key, ProcessOrderHandler, ProcessOrderPayload,
    ReportStatusHandler, ReportStatusPayload, SyncOrdersHandler, SyncOrdersPayload,
};
use crate::stock::{PushStockHandler, StockSync, SyncStockHandler, SyncStockPayload};

/// The running engine.
pub struct SyncEngine {
    db: Arc<Database>,
    config: EngineConfig,
    registry: Arc<ChannelRegistry>,
    governor: Arc<RateGovernor>,
    backlog: Arc<JobBacklog>,
    stock: Arc<StockSync>,
    shutdown_tx: watch::Sender<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Wires the engine together. Does not start any background work.
    pub fn new(
        db: Arc<Database>,
        config: EngineConfig,
        registry: Arc<ChannelRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let governor = Arc::new(RateGovernor::new());
        let stock = Arc::new(StockSync::new(
            Arc::clone(&db),
            config.retry.default_max_attempts,
        ));

        let mut backlog = JobBacklog::new(
            Arc::clone(&db),
            config.retry.clone(),
            config.scheduler.clone(),
            config.workers.clone(),
        );
        backlog.register_handler(Arc::new(SyncStockHandler::new(Arc::clone(&stock))));
        backlog.register_handler(Arc::new(PushStockHandler::new(
            Arc::clone(&db),
            Arc::clone(&registry),
            Arc::clone(&governor),
        )));
        backlog.register_handler(Arc::new(SyncOrdersHandler::new(
            Arc::clone(&db),
            Arc::clone(&registry),
            Arc::clone(&governor),
        )));
        backlog.register_handler(Arc::new(ProcessOrderHandler::new(Arc::clone(&db))));
        backlog.register_handler(Arc::new(ReportStatusHandler::new(
            Arc::clone(&db),
            Arc::clone(&registry),
            Arc::clone(&governor),
        )));
        backlog.register_handler(Arc::new(NotifyHandler::new(sink)));

        let (shutdown_tx, _) = watch::channel(false);

        SyncEngine {
            db,
            config,
            registry,
            governor,
            backlog: Arc::new(backlog),
            stock,
            shutdown_tx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Starts workers and the order-pull scheduler.
    pub fn start(&self) {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut handles = Arc::clone(&self.backlog).spawn(shutdown_rx.clone());
        handles.push(self.spawn_order_scheduler(shutdown_rx));
        self.handles.lock().unwrap().extend(handles);
        info!("Sync engine started");
    }

    /// Signals shutdown and waits for every background task to finish.
    pub async fn shutdown(&self) {
        info!("Sync engine shutting down");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task panicked during shutdown");
            }
        }
        info!("Sync engine stopped");
    }

    fn spawn_order_scheduler(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let db = Arc::clone(&self.db);
        let interval = Duration::from_secs(self.config.scheduler.order_pull_interval_secs);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = schedule_order_pulls(&db).await {
                            error!(error = %e, "Order pull scheduling failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Verifies credentials against the channel and stores the account as
    /// connected. A failed verification stores nothing.
    pub async fn connect_account(
        &self,
        channel_code: &str,
        display_name: &str,
        rate_profile: Option<RateLimitProfile>,
    ) -> SyncResult<ChannelAccount> {
        let adapter = self.registry.get(channel_code)?;

        let account = ChannelAccount {
            id: new_id(),
            channel_code: channel_code.to_string(),
            display_name: display_name.to_string(),
            connection_state: ConnectionState::Connected,
            last_synced_at: None,
            rate_profile: rate_profile.unwrap_or_default(),
            enabled: true,
            created_at: Utc::now(),
        };
        adapter.verify_credentials(&account).await?;

        self.db.accounts().insert(&account).await?;
        info!(account_id = %account.id, channel = %channel_code, "Channel account connected");
        Ok(account)
    }

    /// Soft-disables an account. Its history stays; queued order pulls are
    /// cancelled and queued pushes fail at claim time as non-syncable.
    pub async fn disconnect_account(&self, account_id: &str) -> SyncResult<()> {
        self.db.accounts().disable(account_id).await?;
        self.db
            .jobs()
            .cancel_queued_matching(&pull_dedup_key(account_id))
            .await?;
        self.governor.forget(account_id).await;
        info!(account_id = %account_id, "Channel account disconnected");
        Ok(())
    }

    /// Re-verifies a flagged account and restores it to Connected.
    pub async fn retest_account(&self, account_id: &str) -> SyncResult<()> {
        let account = self.db.accounts().get(account_id).await?;
        let adapter = self.registry.get(&account.channel_code)?;

        match adapter.verify_credentials(&account).await {
            Ok(()) => {
                self.db
                    .accounts()
                    .set_state(account_id, ConnectionState::Connected)
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.db
                    .accounts()
                    .set_state(account_id, ConnectionState::Error)
                    .await?;
                Err(e)
            }
        }
    }

    /// All accounts, or only syncable ones.
    pub async fn list_accounts(&self, syncable_only: bool) -> SyncResult<Vec<ChannelAccount>> {
        Ok(self.db.accounts().list(syncable_only).await?)
    }

    // =========================================================================
    // Sync Operations
    // =========================================================================

    /// Schedules rule evaluation for the given products (inventory changed).
    pub async fn trigger_sync(&self, product_refs: &[String], reason: &str) -> SyncResult<()> {
        if *self.shutdown_tx.borrow() {
            return Err(SyncError::ShuttingDown);
        }

        for product_ref in product_refs {
            let payload = serde_json::to_string(&SyncStockPayload {
                product_ref: product_ref.clone(),
                reason: reason.to_string(),
            })?;
            self.backlog
                .enqueue(
                    EnqueueOptions::new(JobKind::SyncStock, payload)
                        .dedup_key(format!("sync_stock:{product_ref}")),
                )
                .await?;
        }
        Ok(())
    }

    /// Schedules an immediate order pull for one account.
    pub async fn trigger_order_pull(&self, account_id: &str) -> SyncResult<String> {
        let payload = serde_json::to_string(&SyncOrdersPayload {
            account_id: account_id.to_string(),
        })?;
        self.backlog
            .enqueue(
                EnqueueOptions::new(JobKind::SyncOrders, payload)
                    .dedup_key(pull_dedup_key(account_id)),
            )
            .await
    }

    /// Runs rule evaluation inline (bypassing the stock queue). Used by
    /// callers that need the resulting push job ids.
    pub async fn evaluate_stock(&self, product_ref: &str, reason: &str) -> SyncResult<Vec<String>> {
        self.stock.evaluate(product_ref, reason).await
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Applies a merchant-side status change locally, then queues a report of
    /// it back to the order's channel. The report runs on the backlog, so a
    /// governor denial or channel outage retries it instead of losing it; the
    /// dedup key coalesces rapid changes into the latest status. The first
    /// entry into the confirmed path schedules inventory processing, same as
    /// a channel-driven confirmation.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        status: CanonicalStatus,
    ) -> SyncResult<()> {
        let order = self.db.orders().get(order_id).await?;

        let candidate = Order {
            status,
            updated_at: Utc::now(),
            ..order.clone()
        };
        let result = self.db.orders().upsert(&candidate, "merchant", None).await?;

        if result.confirmed_now {
            let payload = serde_json::to_string(&ProcessOrderPayload {
                order_id: order.id.clone(),
                account_id: order.account_id.clone(),
            })?;
            self.backlog
                .enqueue(
                    EnqueueOptions::new(JobKind::ProcessOrder, payload)
                        .dedup_key(format!("process:{}", order.id)),
                )
                .await?;
        }

        let payload = serde_json::to_string(&ReportStatusPayload {
            order_id: order.id.clone(),
            account_id: order.account_id.clone(),
            status,
        })?;
        self.backlog
            .enqueue(
                EnqueueOptions::new(JobKind::ReportStatus, payload)
                    .dedup_key(report_dedup_key(&order.id)),
            )
            .await?;
        Ok(())
    }

    /// Orders waiting on manual review (unmapped statuses, anomalies).
    pub async fn list_orders_needing_review(&self) -> SyncResult<Vec<Order>> {
        Ok(self.db.orders().list_needing_review().await?)
    }

    // =========================================================================
    // Rules
    // =========================================================================

    /// Validates and stores a sync rule.
    pub async fn create_sync_rule(&self, rule: &SyncRule) -> SyncResult<()> {
        rule.validate()?;
        Ok(self.db.rules().insert(rule).await?)
    }

    /// Validates and replaces a sync rule.
    pub async fn update_sync_rule(&self, rule: &SyncRule) -> SyncResult<()> {
        rule.validate()?;
        Ok(self.db.rules().update(rule).await?)
    }

    pub async fn delete_sync_rule(&self, rule_id: &str) -> SyncResult<()> {
        Ok(self.db.rules().delete(rule_id).await?)
    }

    pub async fn list_sync_rules(&self) -> SyncResult<Vec<SyncRule>> {
        Ok(self.db.rules().list().await?)
    }

    // =========================================================================
    // Observability
    // =========================================================================

    /// Aggregate outcomes since the given time, derived from the ledger.
    pub async fn get_sync_stats(&self, since: DateTime<Utc>) -> SyncResult<SyncStats> {
        Ok(self.db.ledger().stats(since).await?)
    }

    /// Filtered ledger entries, newest first.
    pub async fn get_sync_logs(&self, filter: &LedgerFilter) -> SyncResult<Vec<LedgerEntry>> {
        Ok(self.db.ledger().query(filter).await?)
    }

    /// Queue depth per job status.
    pub async fn queue_counts(&self) -> SyncResult<Vec<(JobStatus, i64)>> {
        Ok(self.db.jobs().count_by_status().await?)
    }

    /// The engine's database handle, for embedding applications.
    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }
}

/// Enqueues one order pull per syncable account. Dedup keys keep a slow
/// account from accumulating a backlog of identical pulls.
async fn schedule_order_pulls(db: &Database) -> SyncResult<()> {
    let accounts = db.accounts().list(true).await?;
    for account in &accounts {
        let payload = serde_json::to_string(&SyncOrdersPayload {
            account_id: account.id.clone(),
        })?;
        if let Err(e) = db
            .jobs()
            .enqueue(
                EnqueueOptions::new(JobKind::SyncOrders, payload)
                    .dedup_key(pull_dedup_key(&account.id)),
            )
            .await
        {
            warn!(account_id = %account.id, error = %e, "Failed to schedule order pull");
        }
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

//! End-to-end engine tests against the in-memory channel simulator.
//!
//! Two styles: the first test runs real workers and waits for outcomes; the
//! rest drive the backlog one job at a time so retry and propagation paths
//! are deterministic.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use omni_core::{
    ChannelAccount, ConnectionState, InventoryRecord, JobKind, JobStatus, OrderItem, QueueName,
    RateLimitProfile, RuleScope, SyncRule, SyncStrategy,
};
use omni_store::{Database, DbConfig, EnqueueOptions};
use omni_sync::backlog::JobBacklog;
use omni_sync::channels::memory::{InMemoryChannel, SimFailure};
use omni_sync::config::{RetrySettings, SchedulerSettings, WorkerSettings};
use omni_sync::events::{CollectingSink, NotifyHandler, SyncEvent};
use omni_sync::orders::{ProcessOrderHandler, SyncOrdersHandler, SyncOrdersPayload};
use omni_sync::stock::{PushStockHandler, StockSync, SyncStockHandler};
use omni_sync::{ChannelRegistry, EngineConfig, RateGovernor, SyncEngine, TracingSink};

fn widget(quantity: i64) -> InventoryRecord {
    InventoryRecord {
        product_ref: "SKU-1".into(),
        name: "Widget".into(),
        category: None,
        quantity,
        reserved: 0,
        min_threshold: 5,
        updated_at: Utc::now(),
    }
}

fn exact_rule(id: &str, target_accounts: Vec<String>) -> SyncRule {
    SyncRule {
        id: id.into(),
        name: format!("exact push {id}"),
        strategy: SyncStrategy::Exact,
        scope: RuleScope::AllProducts,
        target_accounts,
        active: true,
    }
}

fn account(id: &str, channel_code: &str, profile: RateLimitProfile) -> ChannelAccount {
    ChannelAccount {
        id: id.into(),
        channel_code: channel_code.into(),
        display_name: format!("{channel_code} {id}"),
        connection_state: ConnectionState::Connected,
        last_synced_at: None,
        rate_profile: profile,
        enabled: true,
        created_at: Utc::now(),
    }
}

/// Full engine with real workers: an inventory edit ends up on the channel.
#[tokio::test]
async fn test_stock_change_reaches_channel_through_workers() {
    let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
    let channel = Arc::new(InMemoryChannel::new("shopmart"));
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::clone(&channel) as _);

    let mut config = EngineConfig::default();
    config.scheduler.poll_interval_ms = 20;

    let engine = SyncEngine::new(
        Arc::clone(&db),
        config,
        Arc::new(registry),
        Arc::new(TracingSink),
    );

    let started = Utc::now();
    let acc = engine
        .connect_account("shopmart", "Main Shopmart", None)
        .await
        .unwrap();
    db.inventory().upsert(&widget(80)).await.unwrap();
    engine
        .create_sync_rule(&exact_rule("rule-1", vec![acc.id.clone()]))
        .await
        .unwrap();

    engine.start();
    engine
        .trigger_sync(&["SKU-1".into()], "manual_edit")
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while channel.pushes().is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "push never reached the channel"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    engine.shutdown().await;

    assert_eq!(channel.listed_quantity("SKU-1"), Some(80));
    let push = &channel.pushes()[0];
    assert_eq!(push.account_id, acc.id);
    assert_eq!(push.quantity, 80);

    // Both the evaluation and the push landed in the ledger as successes.
    let stats = engine.get_sync_stats(started).await.unwrap();
    assert!(stats.total_syncs >= 2);
    assert_eq!(stats.failed_syncs, 0);
    assert!((stats.success_rate() - 1.0).abs() < f64::EPSILON);
}

struct Harness {
    backlog: JobBacklog,
    sink: Arc<CollectingSink>,
}

/// Backlog with every handler registered, driven manually via `process_one`.
fn harness(db: Arc<Database>, registry: ChannelRegistry) -> Harness {
    let registry = Arc::new(registry);
    let governor = Arc::new(RateGovernor::new());
    let stock = Arc::new(StockSync::new(Arc::clone(&db), 3));
    let sink = Arc::new(CollectingSink::new());

    let retry = RetrySettings {
        base_backoff_secs: 1,
        max_backoff_secs: 2,
        default_max_attempts: 3,
        job_timeout_secs: 5,
    };
    let mut backlog = JobBacklog::new(
        Arc::clone(&db),
        retry,
        SchedulerSettings::default(),
        WorkerSettings::default(),
    );
    backlog.register_handler(Arc::new(SyncStockHandler::new(stock)));
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
    backlog.register_handler(Arc::new(NotifyHandler::new(
        Arc::clone(&sink) as Arc<dyn omni_sync::EventSink>
    )));

    Harness { backlog, sink }
}

/// Two transient failures burn attempts but the third try lands, with the
/// full history in the ledger.
#[tokio::test]
async fn test_transient_failures_retry_until_success() {
    let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
    db.accounts()
        .insert(&account("acc-1", "shopmart", RateLimitProfile::default()))
        .await
        .unwrap();
    db.inventory().upsert(&widget(80)).await.unwrap();
    db.rules()
        .insert(&exact_rule("rule-1", vec!["acc-1".into()]))
        .await
        .unwrap();

    let channel = Arc::new(InMemoryChannel::new("shopmart"));
    channel.script_failure(SimFailure::Transient("connection reset".into()));
    channel.script_failure(SimFailure::Transient("connection reset".into()));
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::clone(&channel) as _);

    let h = harness(Arc::clone(&db), registry);
    let job_ids = StockSync::new(Arc::clone(&db), 3)
        .evaluate("SKU-1", "manual_edit")
        .await
        .unwrap();
    let push_id = &job_ids[0];

    // Clear the backoff between attempts so the retry is claimable now.
    for _ in 0..3 {
        db.jobs().reschedule(push_id, Utc::now(), "test").await.ok();
        h.backlog.process_one(QueueName::Push).await.unwrap();
    }

    let job = db.jobs().get(push_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 3);

    // One ledger entry per executed attempt, exactly one terminal.
    let entries = db.ledger().for_job(push_id).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries.iter().filter(|e| e.terminal).count(), 1);
    assert!(entries[2].success && entries[2].terminal);
    assert_eq!(entries[2].quantity, Some(80));

    // The channel saw exactly one successful push.
    assert_eq!(channel.pushes().len(), 1);
    assert_eq!(channel.listed_quantity("SKU-1"), Some(80));
}

/// The governor denies the second write in a 1-per-window profile; the job
/// is parked past the window without burning an attempt.
#[tokio::test]
async fn test_governor_denial_parks_job_without_attempt() {
    let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
    let tight = RateLimitProfile {
        read_limit: 30,
        write_limit: 1,
        window_secs: 60,
    };
    db.accounts()
        .insert(&account("acc-1", "shopmart", tight))
        .await
        .unwrap();
    db.inventory().upsert(&widget(80)).await.unwrap();

    let channel = Arc::new(InMemoryChannel::new("shopmart"));
    let mut registry = ChannelRegistry::new();
    registry.register(Arc::clone(&channel) as _);
    let h = harness(Arc::clone(&db), registry);

    // Two pushes to the same account; distinct dedup keys so both queue.
    let payload = |sku: &str| {
        format!(
            r#"{{"product_ref":"{sku}","account_id":"acc-1","quantity":80,"rule_id":"rule-1"}}"#
        )
    };
    let first = db
        .jobs()
        .enqueue(EnqueueOptions::new(JobKind::PushStockTarget, payload("SKU-1")))
        .await
        .unwrap();
    let second = db
        .jobs()
        .enqueue(EnqueueOptions::new(JobKind::PushStockTarget, payload("SKU-2")))
        .await
        .unwrap();

    h.backlog.process_one(QueueName::Push).await.unwrap();
    h.backlog.process_one(QueueName::Push).await.unwrap();

    assert_eq!(
        db.jobs().get(&first).await.unwrap().status,
        JobStatus::Completed
    );

    let parked = db.jobs().get(&second).await.unwrap();
    assert_eq!(parked.status, JobStatus::Queued);
    assert_eq!(parked.attempts, 0);
    assert!(parked.run_at > Utc::now());
    // No channel call happened, so no ledger entry either.
    assert!(db.ledger().for_job(&second).await.unwrap().is_empty());

    assert_eq!(channel.pushes().len(), 1);
}

/// A sale on one channel flows all the way through: order pull, inventory
/// decrement, rule re-evaluation, push of the new level to the other channel.
#[tokio::test]
async fn test_channel_sale_propagates_to_other_channel() {
    let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
    db.accounts()
        .insert(&account("acc-shop", "shopmart", RateLimitProfile::default()))
        .await
        .unwrap();
    db.accounts()
        .insert(&account("acc-baz", "bazaar", RateLimitProfile::default()))
        .await
        .unwrap();
    db.inventory().upsert(&widget(10)).await.unwrap();
    db.rules()
        .insert(&exact_rule("rule-1", vec!["acc-baz".into()]))
        .await
        .unwrap();

    let shopmart = Arc::new(InMemoryChannel::new("shopmart"));
    let bazaar = Arc::new(InMemoryChannel::new("bazaar"));
    shopmart.inject_order(omni_sync::ChannelOrder {
        channel_order_id: "SM-1001".into(),
        native_status: "paid".into(),
        items: vec![OrderItem {
            product_ref: "SKU-1".into(),
            quantity: 2,
            unit_price_cents: 1999,
        }],
        placed_at: Utc::now(),
    });

    let mut registry = ChannelRegistry::new();
    registry.register(Arc::clone(&shopmart) as _);
    registry.register(Arc::clone(&bazaar) as _);
    let h = harness(Arc::clone(&db), registry);

    let payload = serde_json::to_string(&SyncOrdersPayload {
        account_id: "acc-shop".into(),
    })
    .unwrap();
    db.jobs()
        .enqueue(EnqueueOptions::new(JobKind::SyncOrders, payload))
        .await
        .unwrap();

    // Pull, then the ProcessOrder job it queued.
    assert!(h.backlog.process_one(QueueName::Order).await.unwrap());
    assert!(h.backlog.process_one(QueueName::Order).await.unwrap());

    let record = db.inventory().get("SKU-1").await.unwrap();
    assert_eq!(record.quantity, 8);

    // Re-evaluation, then the push it queued.
    assert!(h.backlog.process_one(QueueName::Stock).await.unwrap());
    assert!(h.backlog.process_one(QueueName::Push).await.unwrap());

    assert_eq!(bazaar.listed_quantity("SKU-1"), Some(8));
    assert_eq!(bazaar.pushes()[0].account_id, "acc-baz");
    assert!(shopmart.pushes().is_empty());

    // Drain notifications and check the announced milestones.
    while h.backlog.process_one(QueueName::Notification).await.unwrap() {}
    let events = h.sink.events();
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::OrderReceived { channel_order_id, .. } if channel_order_id == "SM-1001"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::StockPushed { account_id, quantity: 8, .. } if account_id == "acc-baz"
    )));
}

/// Re-pulling a cancelled order never re-runs the confirmation path: the
/// inventory is decremented exactly once over the order's whole life.
#[tokio::test]
async fn test_confirmation_side_effects_fire_once() {
    let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
    db.accounts()
        .insert(&account("acc-1", "shopmart", RateLimitProfile::default()))
        .await
        .unwrap();
    db.inventory().upsert(&widget(10)).await.unwrap();

    let channel = Arc::new(InMemoryChannel::new("shopmart"));
    let order = |native: &str| omni_sync::ChannelOrder {
        channel_order_id: "SM-1001".into(),
        native_status: native.into(),
        items: vec![OrderItem {
            product_ref: "SKU-1".into(),
            quantity: 2,
            unit_price_cents: 1999,
        }],
        placed_at: Utc::now(),
    };
    channel.inject_order(order("paid"));

    let mut registry = ChannelRegistry::new();
    registry.register(Arc::clone(&channel) as _);
    let h = harness(Arc::clone(&db), registry);

    let pull = || async {
        let payload = serde_json::to_string(&SyncOrdersPayload {
            account_id: "acc-1".into(),
        })
        .unwrap();
        db.jobs()
            .enqueue(EnqueueOptions::new(JobKind::SyncOrders, payload))
            .await
            .unwrap()
    };

    pull().await;
    while h.backlog.process_one(QueueName::Order).await.unwrap() {}
    assert_eq!(db.inventory().get("SKU-1").await.unwrap().quantity, 8);

    // The order advances to dispatched on the channel; still one decrement.
    channel.inject_order(order("dispatched"));
    pull().await;
    while h.backlog.process_one(QueueName::Order).await.unwrap() {}

    assert_eq!(db.inventory().get("SKU-1").await.unwrap().quantity, 8);
    let stored = db
        .orders()
        .get_by_channel("acc-1", "SM-1001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, omni_core::CanonicalStatus::Shipped);
}

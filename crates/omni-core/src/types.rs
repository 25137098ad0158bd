//! # Domain Types
//!
//! Core domain types used throughout Omnisync.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐        │
//! │  │ ChannelAccount  │   │ InventoryRecord │   │     Order       │        │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │        │
//! │  │  id (UUID)      │   │  product_ref    │   │  id (UUID)      │        │
//! │  │  channel_code   │   │  quantity       │   │  channel_order  │        │
//! │  │  state          │   │  reserved       │   │  status         │        │
//! │  │  rate_profile   │   │  min_threshold  │   │  timeline       │        │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘        │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐        │
//! │  │    SyncJob      │   │  LedgerEntry    │   │   SyncStats     │        │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │        │
//! │  │  queue / kind   │   │  one per        │   │  derived on     │        │
//! │  │  attempts       │   │  attempt,       │   │  read from      │        │
//! │  │  dedup_key      │   │  immutable      │   │  the ledger     │        │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! Orders carry both an internal UUID and the channel-native order id; the
//! channel-native id is the dedup key for upserts so re-pulling the same
//! order never creates a duplicate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::CanonicalStatus;

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of a channel account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Credentials verified, account participates in sync.
    Connected,
    /// Last call failed with an auth error; excluded from sync until fixed.
    Error,
    /// Connection created but not yet verified.
    Pending,
    /// Merchant disconnected the account (soft-disable, history preserved).
    Disconnected,
}

impl ConnectionState {
    /// Parses a state from its storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(ConnectionState::Connected),
            "error" => Some(ConnectionState::Error),
            "pending" => Some(ConnectionState::Pending),
            "disconnected" => Some(ConnectionState::Disconnected),
            _ => None,
        }
    }

    /// Storage representation (matches serde rename).
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
            ConnectionState::Pending => "pending",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Rate Limit Profile
// =============================================================================

/// Per-account outbound call budget.
///
/// Channels typically quota reads and writes separately, so the profile
/// carries independent budgets for each operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitProfile {
    /// Read calls permitted per window (order pulls, product listings).
    pub read_limit: u32,
    /// Write calls permitted per window (stock pushes, status updates).
    pub write_limit: u32,
    /// Window length in seconds. Refilled continuously (sliding window).
    pub window_secs: u64,
}

impl Default for RateLimitProfile {
    fn default() -> Self {
        RateLimitProfile {
            read_limit: 30,
            write_limit: 20,
            window_secs: 60,
        }
    }
}

// =============================================================================
// Channel Account
// =============================================================================

/// A merchant's authenticated connection to one external sales channel.
///
/// Created on connect, mutated on test/sync/disconnect, never hard-deleted;
/// the sync ledger references accounts, so history must survive disconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAccount {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Which channel family this account connects to ("shopmart", "bazaar", ...).
    pub channel_code: String,

    /// Display name shown to the merchant.
    pub display_name: String,

    /// Current connection state.
    pub connection_state: ConnectionState,

    /// When this account last completed a successful sync operation.
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Outbound call budget for this account.
    pub rate_profile: RateLimitProfile,

    /// Soft-disable flag. Disabled accounts keep their ledger history.
    pub enabled: bool,

    /// When the account was connected.
    pub created_at: DateTime<Utc>,
}

impl ChannelAccount {
    /// Whether this account should receive sync traffic.
    pub fn is_syncable(&self) -> bool {
        self.enabled && self.connection_state == ConnectionState::Connected
    }
}

// =============================================================================
// Inventory Record
// =============================================================================

/// Per-product stock position.
///
/// Mutated by manual edits, order confirmations, and push results. The
/// `available >= 0` constraint is soft: external channels can oversell, so
/// violations are flagged rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Product reference (SKU or variant key), the identity used on channels.
    pub product_ref: String,

    /// Display name.
    pub name: String,

    /// Category used by CATEGORY-scoped sync rules.
    pub category: Option<String>,

    /// On-hand quantity.
    pub quantity: i64,

    /// Quantity committed to unshipped orders.
    pub reserved: i64,

    /// Low-stock alert threshold.
    pub min_threshold: i64,

    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl InventoryRecord {
    /// Sellable quantity: on-hand minus reserved. May go negative (oversell).
    #[inline]
    pub fn available(&self) -> i64 {
        self.quantity - self.reserved
    }

    /// True when a channel sold stock we no longer have.
    #[inline]
    pub fn is_oversold(&self) -> bool {
        self.available() < 0
    }

    /// True when available stock has fallen to or below the alert threshold.
    #[inline]
    pub fn is_low_stock(&self) -> bool {
        self.available() <= self.min_threshold
    }
}

// =============================================================================
// Orders
// =============================================================================

/// One status change in an order's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    /// Status before the change (None for the initial pull).
    pub from: Option<CanonicalStatus>,
    /// Status after the change.
    pub to: CanonicalStatus,
    /// Who caused it ("channel:shopmart", "merchant", "automation").
    pub actor: String,
    /// Free-form reason (native status string, rule name, ...).
    pub reason: Option<String>,
    /// True when the transition is off the canonical graph.
    pub anomalous: bool,
    /// When the transition was recorded.
    pub at: DateTime<Utc>,
}

/// A line item on an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    /// Product reference matching `InventoryRecord::product_ref`.
    pub product_ref: String,
    /// Units ordered.
    pub quantity: i64,
    /// Unit price in cents as reported by the channel.
    pub unit_price_cents: i64,
}

/// Canonical representation of an order pulled from a channel.
///
/// Upserted by `(account_id, channel_order_id)`: pulling the same channel
/// order twice never creates a second record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Internal identifier (UUID v4).
    pub id: String,

    /// Channel account the order was pulled from.
    pub account_id: String,

    /// Channel family code, denormalized for filtering.
    pub channel_code: String,

    /// Channel-native order id, the dedup key.
    pub channel_order_id: String,

    /// Canonical lifecycle status.
    pub status: CanonicalStatus,

    /// Set when the channel reported a status we could not map.
    pub needs_review: bool,

    /// User assigned by automation or manually.
    pub assigned_to: Option<String>,

    /// Tags applied by automation or manually.
    pub tags: Vec<String>,

    /// Line items.
    pub items: Vec<OrderItem>,

    /// When first pulled.
    pub created_at: DateTime<Utc>,

    /// When last touched by a pull or automation.
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Jobs
// =============================================================================

/// Logical queue a job belongs to. Each queue has its own worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Stock evaluation jobs (light, rate-insensitive).
    Stock,
    /// Order pull jobs (rate-sensitive, capped low).
    Order,
    /// Per-target stock pushes (numerous and short, capped higher).
    Push,
    /// Best-effort notification delivery.
    Notification,
}

impl QueueName {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stock" => Some(QueueName::Stock),
            "order" => Some(QueueName::Order),
            "push" => Some(QueueName::Push),
            "notification" => Some(QueueName::Notification),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Stock => "stock",
            QueueName::Order => "order",
            QueueName::Push => "push",
            QueueName::Notification => "notification",
        }
    }

    /// All queues, in worker startup order.
    pub fn all() -> [QueueName; 4] {
        [
            QueueName::Stock,
            QueueName::Order,
            QueueName::Push,
            QueueName::Notification,
        ]
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit-of-work type. Determines which registered handler runs the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Evaluate sync rules for one product after an inventory mutation.
    SyncStock,
    /// Pull orders for one channel account.
    SyncOrders,
    /// Push one stock quantity to one channel account.
    PushStockTarget,
    /// Apply inventory feedback for a newly confirmed order.
    ProcessOrder,
    /// Report a merchant-made status change back to the order's channel.
    ReportStatus,
    /// Deliver one best-effort event.
    Notify,
}

impl JobKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync_stock" => Some(JobKind::SyncStock),
            "sync_orders" => Some(JobKind::SyncOrders),
            "push_stock_target" => Some(JobKind::PushStockTarget),
            "process_order" => Some(JobKind::ProcessOrder),
            "report_status" => Some(JobKind::ReportStatus),
            "notify" => Some(JobKind::Notify),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SyncStock => "sync_stock",
            JobKind::SyncOrders => "sync_orders",
            JobKind::PushStockTarget => "push_stock_target",
            JobKind::ProcessOrder => "process_order",
            JobKind::ReportStatus => "report_status",
            JobKind::Notify => "notify",
        }
    }

    /// The queue this kind of work runs on.
    pub fn queue(&self) -> QueueName {
        match self {
            JobKind::SyncStock => QueueName::Stock,
            JobKind::SyncOrders | JobKind::ProcessOrder | JobKind::ReportStatus => QueueName::Order,
            JobKind::PushStockTarget => QueueName::Push,
            JobKind::Notify => QueueName::Notification,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a job in the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker (or for its `run_at` to arrive).
    Queued,
    /// Claimed by a worker, handler running.
    Active,
    /// Handler succeeded. Retained briefly for inspection, then discarded.
    Completed,
    /// Terminal failure: attempts exhausted or a non-retryable error.
    Failed,
    /// Worker stopped reporting progress; requeued once, then failed.
    Stalled,
}

impl JobStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "active" => Some(JobStatus::Active),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "stalled" => Some(JobStatus::Stalled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stalled => "stalled",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Queue this job runs on.
    pub queue: QueueName,

    /// Work type (selects the handler).
    pub kind: JobKind,

    /// JSON payload, shape owned by the handler.
    pub payload: String,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Executed attempts so far. Rate-limited re-schedules do not count.
    pub attempts: i64,

    /// Attempts allowed before the job fails terminally.
    pub max_attempts: i64,

    /// Higher runs first within a queue.
    pub priority: i64,

    /// Coalescing key: at most one QUEUED job per key.
    pub dedup_key: Option<String>,

    /// Earliest time a worker may claim the job (backoff scheduling).
    pub run_at: DateTime<Utc>,

    /// Last progress report from the owning worker (stall detection).
    pub heartbeat_at: Option<DateTime<Utc>>,

    /// How many times the job was recovered from a stall. Max one.
    pub stall_count: i64,

    /// Most recent error message.
    pub last_error: Option<String>,

    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,

    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Sync Ledger
// =============================================================================

/// Immutable record of one sync attempt's outcome.
///
/// One entry is written per executed attempt. A job reaching a terminal
/// state produces exactly one entry with `terminal = true`. Entries are
/// never mutated after write; statistics are derived on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Job this attempt belonged to.
    pub job_id: String,

    /// Work type.
    pub kind: JobKind,

    /// Target channel account, when the job addressed one.
    pub account_id: Option<String>,

    /// Product involved, when the job addressed one.
    pub product_ref: Option<String>,

    /// Quantity involved (e.g., the pushed target quantity).
    pub quantity: Option<i64>,

    /// Attempt number (1-based).
    pub attempt: i64,

    /// Whether this attempt succeeded.
    pub success: bool,

    /// Whether this attempt finalized the job (completed or failed).
    pub terminal: bool,

    /// Human-readable error detail for failed attempts.
    pub error: Option<String>,

    /// When the attempt finished.
    pub created_at: DateTime<Utc>,
}

/// Aggregate sync statistics, computed on read from the ledger.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncStats {
    /// Terminal outcomes in the range.
    pub total_syncs: i64,
    /// Terminal successes.
    pub successful_syncs: i64,
    /// Terminal failures.
    pub failed_syncs: i64,
}

impl SyncStats {
    /// Success rate in [0, 1]. Zero when nothing has run.
    pub fn success_rate(&self) -> f64 {
        if self.total_syncs == 0 {
            0.0
        } else {
            self.successful_syncs as f64 / self.total_syncs as f64
        }
    }
}

// =============================================================================
// Automation Rules
// =============================================================================

/// Action applied to an order by an automation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum AutomationAction {
    /// Append a tag (idempotent: duplicates are not added).
    AddTag(String),
    /// Assign the order to a user.
    Assign(String),
}

/// Tag/assign automation evaluated after every order status write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Display name.
    pub name: String,

    /// Only orders in this status match (None = any).
    pub match_status: Option<CanonicalStatus>,

    /// Only orders from this channel code match (None = any).
    pub match_channel: Option<String>,

    /// Action to apply.
    pub action: AutomationAction,

    /// Inactive rules are skipped.
    pub active: bool,
}

impl AutomationRule {
    /// Whether this rule applies to the given order.
    pub fn matches(&self, order: &Order) -> bool {
        if !self.active {
            return false;
        }
        if let Some(status) = self.match_status {
            if order.status != status {
                return false;
            }
        }
        if let Some(ref channel) = self.match_channel {
            if &order.channel_code != channel {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

//! # Channel Adapter
//!
//! The seam between the engine and external sales channels. Everything the
//! engine knows about a channel goes through this trait; the engine never
//! sees native wire formats, only the adapter's normalized types plus the
//! channel's raw status vocabulary (which [`omni_core::StatusMap`] resolves).
//!
//! ## Adapter Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      ChannelAdapter Boundary                            │
//! │                                                                         │
//! │   Engine ──► push_stock(account, product_ref, qty) ──► channel API      │
//! │   Engine ──► fetch_orders(account, since) ◄── ChannelOrder list         │
//! │   Engine ──► list_products(account) ◄── ChannelProduct list             │
//! │                                                                         │
//! │   Failures come back as the SyncError taxonomy: the adapter decides     │
//! │   Auth vs RateLimited vs Transient vs Rejected, the backlog decides     │
//! │   what happens next.                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use omni_core::{CanonicalStatus, ChannelAccount, OrderItem, StatusMap};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Wire Types
// =============================================================================

/// A product listing as the channel reports it.
#[derive(Debug, Clone)]
pub struct ChannelProduct {
    /// Product reference matching `InventoryRecord::product_ref`.
    pub product_ref: String,
    /// Quantity the channel currently advertises.
    pub quantity: i64,
}

/// An order as the channel reports it, status still in native vocabulary.
#[derive(Debug, Clone)]
pub struct ChannelOrder {
    /// Channel-native order id (the dedup key).
    pub channel_order_id: String,
    /// Native status string, resolved later via the adapter's status map.
    pub native_status: String,
    /// Line items.
    pub items: Vec<OrderItem>,
    /// When the channel says the order was placed.
    pub placed_at: DateTime<Utc>,
}

// =============================================================================
// Adapter Trait
// =============================================================================

/// One implementation per channel family. All methods take the account so a
/// single adapter instance serves every account on that channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel family code ("shopmart", "bazaar", ...).
    fn channel_code(&self) -> &str;

    /// Native-to-canonical status lookup table for this channel.
    fn status_map(&self) -> &StatusMap;

    /// Verifies the account's credentials (connect and re-test flows).
    async fn verify_credentials(&self, account: &ChannelAccount) -> SyncResult<()>;

    /// Lists the channel's current product quantities.
    async fn list_products(&self, account: &ChannelAccount) -> SyncResult<Vec<ChannelProduct>>;

    /// Pushes one quantity to one listing.
    async fn push_stock(
        &self,
        account: &ChannelAccount,
        product_ref: &str,
        quantity: i64,
    ) -> SyncResult<()>;

    /// Fetches orders updated since the given time (None = everything).
    async fn fetch_orders(
        &self,
        account: &ChannelAccount,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<ChannelOrder>>;

    /// Reports a merchant-side status change back to the channel.
    async fn update_order_status(
        &self,
        account: &ChannelAccount,
        channel_order_id: &str,
        status: CanonicalStatus,
    ) -> SyncResult<()>;
}

// =============================================================================
// Registry
// =============================================================================

/// Maps channel codes to adapter instances. Built once at startup; lookups
/// are lock-free afterwards.
#[derive(Default)]
pub struct ChannelRegistry {
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its channel code. Later registrations for
    /// the same code replace earlier ones.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters
            .insert(adapter.channel_code().to_string(), adapter);
    }

    /// Resolves the adapter for a channel code.
    pub fn get(&self, channel_code: &str) -> SyncResult<Arc<dyn ChannelAdapter>> {
        self.adapters
            .get(channel_code)
            .cloned()
            .ok_or_else(|| SyncError::ChannelNotRegistered(channel_code.to_string()))
    }

    /// Registered channel codes.
    pub fn codes(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

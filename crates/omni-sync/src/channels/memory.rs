//! # In-Memory Channel Simulator
//!
//! A [`ChannelAdapter`] backed by process memory. Speaks a typical
//! marketplace status vocabulary and lets tests script the next failures
//! so every branch of the retry taxonomy is reachable on demand.
//!
//! ## Scripting
//! ```text
//! channel.script_failure(SimFailure::Transient("reset"));   // next call fails
//! channel.script_failure(SimFailure::Transient("reset"));   // ...and the one after
//! // third call succeeds
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use omni_core::{CanonicalStatus, ChannelAccount, StatusMap};

use crate::adapter::{ChannelAdapter, ChannelOrder, ChannelProduct};
use crate::error::{SyncError, SyncResult};

/// A failure to inject into the next channel call.
#[derive(Debug, Clone)]
pub enum SimFailure {
    /// Credentials rejected.
    Auth,
    /// Channel-side rate limit with a retry-after hint.
    RateLimited(u64),
    /// Recoverable failure (network flake, 5xx).
    Transient(String),
    /// Permanent refusal (unknown SKU, validation).
    Rejected(String),
}

/// One recorded stock push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRecord {
    pub account_id: String,
    pub product_ref: String,
    pub quantity: i64,
}

#[derive(Default)]
struct SimState {
    /// Listed quantity per product ref.
    products: HashMap<String, i64>,
    /// Orders waiting to be pulled.
    orders: Vec<ChannelOrder>,
    /// Every successful push, in order.
    push_journal: Vec<PushRecord>,
    /// Failures consumed one per API call, FIFO.
    scripted_failures: VecDeque<SimFailure>,
    /// Status updates reported back by the merchant side.
    status_updates: Vec<(String, CanonicalStatus)>,
}

/// In-process channel simulator.
pub struct InMemoryChannel {
    code: String,
    status_map: StatusMap,
    state: Mutex<SimState>,
}

impl InMemoryChannel {
    pub fn new(code: impl Into<String>) -> Self {
        InMemoryChannel {
            code: code.into(),
            status_map: StatusMap::simulator(),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Seeds a product listing.
    pub fn seed_product(&self, product_ref: impl Into<String>, quantity: i64) {
        self.state
            .lock()
            .unwrap()
            .products
            .insert(product_ref.into(), quantity);
    }

    /// Queues an order for the next pull.
    pub fn inject_order(&self, order: ChannelOrder) {
        self.state.lock().unwrap().orders.push(order);
    }

    /// Scripts a failure for the next API call. Multiple calls stack FIFO.
    pub fn script_failure(&self, failure: SimFailure) {
        self.state
            .lock()
            .unwrap()
            .scripted_failures
            .push_back(failure);
    }

    /// Every successful push so far.
    pub fn pushes(&self) -> Vec<PushRecord> {
        self.state.lock().unwrap().push_journal.clone()
    }

    /// Status updates reported by the merchant side.
    pub fn reported_statuses(&self) -> Vec<(String, CanonicalStatus)> {
        self.state.lock().unwrap().status_updates.clone()
    }

    /// Currently listed quantity for a product.
    pub fn listed_quantity(&self, product_ref: &str) -> Option<i64> {
        self.state.lock().unwrap().products.get(product_ref).copied()
    }

    fn take_failure(&self, account: &ChannelAccount) -> SyncResult<()> {
        let next = self.state.lock().unwrap().scripted_failures.pop_front();
        match next {
            None => Ok(()),
            Some(SimFailure::Auth) => Err(SyncError::Auth {
                account_id: account.id.clone(),
                detail: "simulated credential rejection".into(),
            }),
            Some(SimFailure::RateLimited(secs)) => Err(SyncError::RateLimited {
                retry_after_secs: secs,
            }),
            Some(SimFailure::Transient(detail)) => Err(SyncError::Transient(detail)),
            Some(SimFailure::Rejected(detail)) => Err(SyncError::Rejected(detail)),
        }
    }
}

#[async_trait]
impl ChannelAdapter for InMemoryChannel {
    fn channel_code(&self) -> &str {
        &self.code
    }

    fn status_map(&self) -> &StatusMap {
        &self.status_map
    }

    async fn verify_credentials(&self, account: &ChannelAccount) -> SyncResult<()> {
        self.take_failure(account)
    }

    async fn list_products(&self, account: &ChannelAccount) -> SyncResult<Vec<ChannelProduct>> {
        self.take_failure(account)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .products
            .iter()
            .map(|(product_ref, &quantity)| ChannelProduct {
                product_ref: product_ref.clone(),
                quantity,
            })
            .collect())
    }

    async fn push_stock(
        &self,
        account: &ChannelAccount,
        product_ref: &str,
        quantity: i64,
    ) -> SyncResult<()> {
        self.take_failure(account)?;

        let mut state = self.state.lock().unwrap();
        state.products.insert(product_ref.to_string(), quantity);
        state.push_journal.push(PushRecord {
            account_id: account.id.clone(),
            product_ref: product_ref.to_string(),
            quantity,
        });

        debug!(
            channel = %self.code,
            account_id = %account.id,
            product_ref = %product_ref,
            quantity,
            "Simulated stock push"
        );
        Ok(())
    }

    async fn fetch_orders(
        &self,
        account: &ChannelAccount,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<ChannelOrder>> {
        self.take_failure(account)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .iter()
            .filter(|o| since.map_or(true, |cutoff| o.placed_at >= cutoff))
            .cloned()
            .collect())
    }

    async fn update_order_status(
        &self,
        account: &ChannelAccount,
        channel_order_id: &str,
        status: CanonicalStatus,
    ) -> SyncResult<()> {
        self.take_failure(account)?;
        self.state
            .lock()
            .unwrap()
            .status_updates
            .push((channel_order_id.to_string(), status));
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

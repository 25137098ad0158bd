//! # Rate Governor
//!
//! Sliding-window call budgets per (account, operation class). Every
//! channel-bound call asks the governor for a slot first; a denial means no
//! call is made at all, so the budget is only ever consumed by real traffic.
//!
//! ## Window Accounting
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │              Sliding Window per (account × Read|Write)                  │
//! │                                                                         │
//! │   timestamps: [t1, t2, t3, ...]   (VecDeque, oldest first)              │
//! │                                                                         │
//! │   check(now):                                                           │
//! │     1. pop timestamps older than now - window                           │
//! │     2. len < limit  ──► push now, slot granted                          │
//! │     3. len = limit  ──► denied; retry-after = when the oldest           │
//! │                         timestamp leaves the window                     │
//! │                                                                         │
//! │   Reads and writes have independent budgets because channels quota      │
//! │   them separately.                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use omni_core::ChannelAccount;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Operation Class
// =============================================================================

/// Which budget a call draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Order pulls, product listings.
    Read,
    /// Stock pushes, status updates.
    Write,
}

impl OpClass {
    fn as_str(&self) -> &'static str {
        match self {
            OpClass::Read => "read",
            OpClass::Write => "write",
        }
    }
}

// =============================================================================
// Governor
// =============================================================================

/// Shared sliding-window limiter for all outbound channel traffic.
#[derive(Default)]
pub struct RateGovernor {
    windows: Mutex<HashMap<(String, OpClass), VecDeque<Instant>>>,
}

impl RateGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single non-blocking window check. `Err` carries the precise time
    /// until the oldest in-window call expires and a slot frees up.
    async fn check_slot(
        &self,
        account: &ChannelAccount,
        class: OpClass,
    ) -> Result<(), Duration> {
        let limit = match class {
            OpClass::Read => account.rate_profile.read_limit,
            OpClass::Write => account.rate_profile.write_limit,
        } as usize;
        let window = Duration::from_secs(account.rate_profile.window_secs);
        let now = Instant::now();

        let mut windows = self.windows.lock().await;
        let timestamps = windows
            .entry((account.id.clone(), class))
            .or_insert_with(VecDeque::new);

        while let Some(&oldest) = timestamps.front() {
            if now.duration_since(oldest) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() < limit {
            timestamps.push_back(now);
            return Ok(());
        }

        // Full: the oldest in-window call determines when a slot frees up.
        let oldest = timestamps.front().copied().unwrap_or(now);
        let retry_after = window.saturating_sub(now.duration_since(oldest));

        debug!(
            account_id = %account.id,
            class = class.as_str(),
            limit,
            retry_after_ms = retry_after.as_millis() as u64,
            "Rate governor denied slot"
        );
        Err(retry_after)
    }

    /// Requests a slot without waiting. `Ok(())` grants it and records the
    /// call; `Err` is a denial carrying the seconds until a slot frees up.
    ///
    /// This is the backlog path: a denied job is parked until the window
    /// turns over instead of holding a worker.
    pub async fn try_acquire(
        &self,
        account: &ChannelAccount,
        class: OpClass,
    ) -> Result<(), u64> {
        self.check_slot(account, class)
            .await
            .map_err(|retry_after| retry_after.as_secs().max(1))
    }

    /// Requests a slot, waiting as long as it takes for one to free up.
    ///
    /// Waiting is cooperative (a timer sleep per window turnover), so other
    /// accounts and classes proceed unhindered.
    pub async fn acquire(&self, account: &ChannelAccount, class: OpClass) -> SyncResult<()> {
        loop {
            match self.check_slot(account, class).await {
                Ok(()) => return Ok(()),
                // Small pad so the re-check lands after the slot expires.
                Err(wait) => tokio::time::sleep(wait + Duration::from_millis(10)).await,
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up once waiting would
    /// exceed `timeout`, surfacing the denial as [`SyncError::RateLimited`].
    pub async fn acquire_within(
        &self,
        account: &ChannelAccount,
        class: OpClass,
        timeout: Duration,
    ) -> SyncResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.check_slot(account, class).await {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    if Instant::now() + wait > deadline {
                        return Err(SyncError::RateLimited {
                            retry_after_secs: wait.as_secs().max(1),
                        });
                    }
                    tokio::time::sleep(wait + Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// Drops all recorded traffic for an account (disconnect cleanup).
    pub async fn forget(&self, account_id: &str) {
        self.windows
            .lock()
            .await
            .retain(|(id, _), _| id != account_id);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use omni_core::{ConnectionState, RateLimitProfile};

    fn account_with_window(write_limit: u32, window_secs: u64) -> ChannelAccount {
        ChannelAccount {
            id: "acc-1".into(),
            channel_code: "shopmart".into(),
            display_name: "Shopmart".into(),
            connection_state: ConnectionState::Connected,
            last_synced_at: None,
            rate_profile: RateLimitProfile {
                read_limit: 5,
                write_limit,
                window_secs,
            },
            enabled: true,
            created_at: Utc::now(),
        }
    }

    fn account(write_limit: u32) -> ChannelAccount {
        account_with_window(write_limit, 60)
    }

    #[tokio::test]
    async fn test_grants_up_to_limit_then_denies() {
        let governor = RateGovernor::new();
        let acc = account(3);

        for _ in 0..3 {
            assert!(governor.try_acquire(&acc, OpClass::Write).await.is_ok());
        }

        let denied = governor.try_acquire(&acc, OpClass::Write).await;
        assert!(denied.is_err());
        assert!(denied.unwrap_err() >= 1);
    }

    #[tokio::test]
    async fn test_read_and_write_budgets_are_independent() {
        let governor = RateGovernor::new();
        let acc = account(1);

        assert!(governor.try_acquire(&acc, OpClass::Write).await.is_ok());
        assert!(governor.try_acquire(&acc, OpClass::Write).await.is_err());

        // Write exhaustion leaves reads untouched.
        assert!(governor.try_acquire(&acc, OpClass::Read).await.is_ok());
    }

    #[tokio::test]
    async fn test_accounts_do_not_share_budgets() {
        let governor = RateGovernor::new();
        let a = account(1);
        let mut b = account(1);
        b.id = "acc-2".into();

        assert!(governor.try_acquire(&a, OpClass::Write).await.is_ok());
        assert!(governor.try_acquire(&b, OpClass::Write).await.is_ok());
        assert!(governor.try_acquire(&a, OpClass::Write).await.is_err());
    }

    // The window bookkeeping runs on std::time::Instant, so these tests use
    // short real windows rather than a paused tokio clock.
    #[tokio::test]
    async fn test_acquire_blocks_until_slot_frees() {
        let governor = RateGovernor::new();
        let acc = account_with_window(1, 1);

        governor.acquire(&acc, OpClass::Write).await.unwrap();

        // Budget exhausted; this call must wait out the 1s window.
        let started = Instant::now();
        governor.acquire(&acc, OpClass::Write).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(900));

        // And the wait consumed a real slot.
        assert!(governor.try_acquire(&acc, OpClass::Write).await.is_err());
    }

    #[tokio::test]
    async fn test_acquire_within_gives_up_at_deadline() {
        let governor = RateGovernor::new();
        let acc = account(1);

        governor
            .acquire_within(&acc, OpClass::Write, Duration::from_millis(50))
            .await
            .unwrap();

        // A 60s window cannot turn over inside a 50ms deadline.
        let err = governor
            .acquire_within(&acc, OpClass::Write, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RateLimited { .. }));
        assert!(!err.counts_attempt());
    }

    #[tokio::test]
    async fn test_forget_clears_account_history() {
        let governor = RateGovernor::new();
        let acc = account(1);

        governor.try_acquire(&acc, OpClass::Write).await.unwrap();
        governor.forget("acc-1").await;
        assert!(governor.try_acquire(&acc, OpClass::Write).await.is_ok());
    }
}

//! # Channel Account Repository
//!
//! Accounts are created on connect and soft-disabled on disconnect; rows are
//! never deleted because the sync ledger references them.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use omni_core::{ChannelAccount, ConnectionState, RateLimitProfile};

use crate::error::{StoreError, StoreResult};

/// Repository for channel account operations.
#[derive(Debug, Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    pub fn new(pool: SqlitePool) -> Self {
        AccountRepository { pool }
    }

    /// Inserts a new account (created on connect).
    pub async fn insert(&self, account: &ChannelAccount) -> StoreResult<()> {
        debug!(id = %account.id, channel = %account.channel_code, "Inserting channel account");

        sqlx::query(
            r#"
            INSERT INTO channel_accounts (
                id, channel_code, display_name, connection_state,
                last_synced_at, rate_profile, enabled, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&account.id)
        .bind(&account.channel_code)
        .bind(&account.display_name)
        .bind(account.connection_state.as_str())
        .bind(account.last_synced_at)
        .bind(serde_json::to_string(&account.rate_profile)?)
        .bind(account.enabled)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetches one account by id.
    pub async fn get(&self, id: &str) -> StoreResult<ChannelAccount> {
        let row = sqlx::query("SELECT * FROM channel_accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "ChannelAccount".to_string(),
                id: id.to_string(),
            })?;

        row_to_account(&row)
    }

    /// Lists all accounts, optionally only syncable ones
    /// (enabled + connected).
    pub async fn list(&self, syncable_only: bool) -> StoreResult<Vec<ChannelAccount>> {
        let sql = if syncable_only {
            "SELECT * FROM channel_accounts
             WHERE enabled = 1 AND connection_state = 'connected'
             ORDER BY created_at"
        } else {
            "SELECT * FROM channel_accounts ORDER BY created_at"
        };

        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_account).collect()
    }

    /// Updates the connection state (e.g., auth failure flags `Error`).
    pub async fn set_state(&self, id: &str, state: ConnectionState) -> StoreResult<()> {
        debug!(id = %id, state = %state, "Updating account connection state");

        sqlx::query("UPDATE channel_accounts SET connection_state = ?2 WHERE id = ?1")
            .bind(id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Records a successful sync touch.
    pub async fn set_last_synced(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE channel_accounts SET last_synced_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Soft-disables an account (disconnect). History is preserved.
    pub async fn disable(&self, id: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE channel_accounts
             SET enabled = 0, connection_state = 'disconnected'
             WHERE id = ?1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> StoreResult<ChannelAccount> {
    let state_raw: String = row.try_get("connection_state")?;
    let connection_state = ConnectionState::parse(&state_raw)
        .ok_or_else(|| StoreError::corrupt("channel_accounts", format!("state '{state_raw}'")))?;

    let profile_raw: String = row.try_get("rate_profile")?;
    let rate_profile: RateLimitProfile = serde_json::from_str(&profile_raw)?;

    Ok(ChannelAccount {
        id: row.try_get("id")?,
        channel_code: row.try_get("channel_code")?,
        display_name: row.try_get("display_name")?,
        connection_state,
        last_synced_at: row.try_get("last_synced_at")?,
        rate_profile,
        enabled: row.try_get("enabled")?,
        created_at: row.try_get("created_at")?,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

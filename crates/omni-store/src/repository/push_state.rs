//! # Push State Repository
//!
//! Last successfully pushed quantity per (product, account). Written only
//! after a push succeeds, so a failed push never suppresses the next
//! threshold evaluation.

use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::error::StoreResult;

/// Repository for per-target push state.
#[derive(Debug, Clone)]
pub struct PushStateRepository {
    pool: SqlitePool,
}

impl PushStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        PushStateRepository { pool }
    }

    /// Last quantity successfully pushed to `account_id` for `product_ref`,
    /// or None when nothing has been pushed yet.
    pub async fn last_pushed(
        &self,
        product_ref: &str,
        account_id: &str,
    ) -> StoreResult<Option<i64>> {
        let row = sqlx::query(
            "SELECT last_pushed_qty FROM push_state
             WHERE product_ref = ?1 AND account_id = ?2",
        )
        .bind(product_ref)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_get("last_pushed_qty"))
            .transpose()
            .map_err(Into::into)
    }

    /// Records a successful push.
    pub async fn record(
        &self,
        product_ref: &str,
        account_id: &str,
        quantity: i64,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO push_state (product_ref, account_id, last_pushed_qty, pushed_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (product_ref, account_id) DO UPDATE SET
                last_pushed_qty = excluded.last_pushed_qty,
                pushed_at = excluded.pushed_at
            "#,
        )
        .bind(product_ref)
        .bind(account_id)
        .bind(quantity)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

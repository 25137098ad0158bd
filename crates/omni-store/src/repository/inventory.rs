//! # Inventory Repository
//!
//! Stock positions with transactional adjustments.
//!
//! ## The Serialization Point
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │              Concurrent Inventory Mutations                             │
//! │                                                                         │
//! │  order confirmation (decrement)──┐                                      │
//! │  manual edit (set)───────────────┼──► adjust()/set_quantity()           │
//! │  push result feedback────────────┘        │                             │
//! │                                           ▼                             │
//! │                    BEGIN; SELECT quantity; UPDATE; COMMIT               │
//! │                                                                         │
//! │  SQLite's single writer + the read-modify-write transaction serialize   │
//! │  concurrent deltas on the same product. available < 0 is allowed        │
//! │  (channels can oversell) and surfaced by the returned record.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use omni_core::InventoryRecord;

use crate::error::{StoreError, StoreResult};

/// Repository for inventory operations.
#[derive(Debug, Clone)]
pub struct InventoryRepository {
    pool: SqlitePool,
}

impl InventoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        InventoryRepository { pool }
    }

    /// Inserts or replaces a stock position.
    pub async fn upsert(&self, record: &InventoryRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory (
                product_ref, name, category, quantity, reserved, min_threshold, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (product_ref) DO UPDATE SET
                name = excluded.name,
                category = excluded.category,
                quantity = excluded.quantity,
                reserved = excluded.reserved,
                min_threshold = excluded.min_threshold,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.product_ref)
        .bind(&record.name)
        .bind(&record.category)
        .bind(record.quantity)
        .bind(record.reserved)
        .bind(record.min_threshold)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetches one stock position.
    pub async fn get(&self, product_ref: &str) -> StoreResult<InventoryRecord> {
        let row = sqlx::query("SELECT * FROM inventory WHERE product_ref = ?1")
            .bind(product_ref)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "InventoryRecord".to_string(),
                id: product_ref.to_string(),
            })?;

        row_to_record(&row)
    }

    /// Applies a delta to the on-hand quantity inside a transaction and
    /// returns the updated record.
    ///
    /// This is the one mutation path that must serialize concurrent writers
    /// (order confirmations decrement while manual edits increment). The
    /// read-modify-write runs in a single transaction; oversell (available
    /// going negative) is logged and allowed.
    pub async fn adjust(&self, product_ref: &str, delta: i64) -> StoreResult<InventoryRecord> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM inventory WHERE product_ref = ?1")
            .bind(product_ref)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "InventoryRecord".to_string(),
                id: product_ref.to_string(),
            })?;

        let mut record = row_to_record(&row)?;
        record.quantity += delta;
        record.updated_at = Utc::now();

        sqlx::query(
            "UPDATE inventory SET quantity = ?2, updated_at = ?3 WHERE product_ref = ?1",
        )
        .bind(product_ref)
        .bind(record.quantity)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(product_ref = %product_ref, delta, quantity = record.quantity, "Adjusted inventory");

        if record.is_oversold() {
            warn!(
                product_ref = %product_ref,
                available = record.available(),
                "Inventory oversold"
            );
        }

        Ok(record)
    }

    /// Sets the absolute on-hand quantity (manual edit) and returns the
    /// updated record.
    pub async fn set_quantity(&self, product_ref: &str, quantity: i64) -> StoreResult<InventoryRecord> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM inventory WHERE product_ref = ?1")
            .bind(product_ref)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "InventoryRecord".to_string(),
                id: product_ref.to_string(),
            })?;

        let mut record = row_to_record(&row)?;
        record.quantity = quantity;
        record.updated_at = Utc::now();

        sqlx::query(
            "UPDATE inventory SET quantity = ?2, updated_at = ?3 WHERE product_ref = ?1",
        )
        .bind(product_ref)
        .bind(record.quantity)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(record)
    }

    /// Lists records at or below their low-stock threshold.
    pub async fn list_low_stock(&self) -> StoreResult<Vec<InventoryRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM inventory
             WHERE quantity - reserved <= min_threshold
             ORDER BY product_ref",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<InventoryRecord> {
    Ok(InventoryRecord {
        product_ref: row.try_get("product_ref")?,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        quantity: row.try_get("quantity")?,
        reserved: row.try_get("reserved")?,
        min_threshold: row.try_get("min_threshold")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

//! # Sync Ledger Repository
//!
//! Append-only audit trail. One row per executed attempt; rows are never
//! updated or deleted by the engine. Statistics are aggregates computed on
//! read from terminal rows.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use omni_core::{JobKind, LedgerEntry, SyncStats};

use crate::error::{StoreError, StoreResult};

/// Filter for ledger queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    /// Only entries for this account.
    pub account_id: Option<String>,
    /// Only entries for this product.
    pub product_ref: Option<String>,
    /// Only entries of this kind.
    pub kind: Option<JobKind>,
    /// Only failures (success = 0).
    pub failures_only: bool,
    /// Only entries at or after this time.
    pub since: Option<DateTime<Utc>>,
    /// Result cap, newest first.
    pub limit: i64,
}

impl LedgerFilter {
    pub fn new() -> Self {
        LedgerFilter {
            limit: 100,
            ..Default::default()
        }
    }
}

/// Repository for the append-only sync ledger.
#[derive(Debug, Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
}

impl LedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LedgerRepository { pool }
    }

    /// Appends one attempt record. The only write this repository offers.
    pub async fn append(&self, entry: &LedgerEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_ledger (
                id, job_id, kind, account_id, product_ref, quantity,
                attempt, success, terminal, error, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.job_id)
        .bind(entry.kind.as_str())
        .bind(&entry.account_id)
        .bind(&entry.product_ref)
        .bind(entry.quantity)
        .bind(entry.attempt)
        .bind(entry.success)
        .bind(entry.terminal)
        .bind(&entry.error)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Queries entries, newest first.
    pub async fn query(&self, filter: &LedgerFilter) -> StoreResult<Vec<LedgerEntry>> {
        let mut sql = String::from("SELECT * FROM sync_ledger WHERE 1 = 1");
        if filter.account_id.is_some() {
            sql.push_str(" AND account_id = ?1");
        }
        if filter.product_ref.is_some() {
            sql.push_str(" AND product_ref = ?2");
        }
        if filter.kind.is_some() {
            sql.push_str(" AND kind = ?3");
        }
        if filter.failures_only {
            sql.push_str(" AND success = 0");
        }
        if filter.since.is_some() {
            sql.push_str(" AND created_at >= ?4");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?5");

        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        let rows = sqlx::query(&sql)
            .bind(&filter.account_id)
            .bind(&filter.product_ref)
            .bind(filter.kind.map(|k| k.as_str()))
            .bind(filter.since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_entry).collect()
    }

    /// All entries for one job, in attempt order.
    pub async fn for_job(&self, job_id: &str) -> StoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query("SELECT * FROM sync_ledger WHERE job_id = ?1 ORDER BY attempt")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_entry).collect()
    }

    /// Aggregate statistics over terminal entries in [since, now].
    ///
    /// Only terminal rows count: a job that retried twice then succeeded is
    /// one successful sync, not one success and two failures.
    pub async fn stats(&self, since: DateTime<Utc>) -> StoreResult<SyncStats> {
        let row = sqlx::query(
            "SELECT
                 COUNT(*) AS total,
                 COALESCE(SUM(success), 0) AS successes
             FROM sync_ledger
             WHERE terminal = 1 AND created_at >= ?1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let total: i64 = row.try_get("total")?;
        let successes: i64 = row.try_get("successes")?;

        Ok(SyncStats {
            total_syncs: total,
            successful_syncs: successes,
            failed_syncs: total - successes,
        })
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> StoreResult<LedgerEntry> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = JobKind::parse(&kind_raw)
        .ok_or_else(|| StoreError::corrupt("sync_ledger", format!("kind '{kind_raw}'")))?;

    Ok(LedgerEntry {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        kind,
        account_id: row.try_get("account_id")?,
        product_ref: row.try_get("product_ref")?,
        quantity: row.try_get("quantity")?,
        attempt: row.try_get("attempt")?,
        success: row.try_get("success")?,
        terminal: row.try_get("terminal")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

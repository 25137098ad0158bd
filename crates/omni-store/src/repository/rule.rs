//! # Sync Rule Repository
//!
//! CRUD for merchant-configured sync rules. The engine reads rules only at
//! evaluation time; edits take effect on the next inventory change.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use omni_core::{RuleScope, SyncRule, SyncStrategy};

use crate::error::{StoreError, StoreResult};

/// Repository for sync rule operations.
#[derive(Debug, Clone)]
pub struct RuleRepository {
    pool: SqlitePool,
}

impl RuleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        RuleRepository { pool }
    }

    /// Inserts a new rule. Callers validate first (`SyncRule::validate`).
    pub async fn insert(&self, rule: &SyncRule) -> StoreResult<()> {
        debug!(id = %rule.id, strategy = rule.strategy.name(), "Inserting sync rule");

        sqlx::query(
            r#"
            INSERT INTO sync_rules (id, name, strategy, scope, target_accounts, active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(serde_json::to_string(&rule.strategy)?)
        .bind(serde_json::to_string(&rule.scope)?)
        .bind(serde_json::to_string(&rule.target_accounts)?)
        .bind(rule.active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Replaces an existing rule.
    pub async fn update(&self, rule: &SyncRule) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_rules
            SET name = ?2, strategy = ?3, scope = ?4, target_accounts = ?5, active = ?6
            WHERE id = ?1
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(serde_json::to_string(&rule.strategy)?)
        .bind(serde_json::to_string(&rule.scope)?)
        .bind(serde_json::to_string(&rule.target_accounts)?)
        .bind(rule.active)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "SyncRule".to_string(),
                id: rule.id.clone(),
            });
        }

        Ok(())
    }

    /// Fetches one rule by id.
    pub async fn get(&self, id: &str) -> StoreResult<SyncRule> {
        let row = sqlx::query("SELECT * FROM sync_rules WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "SyncRule".to_string(),
                id: id.to_string(),
            })?;

        row_to_rule(&row)
    }

    /// Lists all rules.
    pub async fn list(&self) -> StoreResult<Vec<SyncRule>> {
        let rows = sqlx::query("SELECT * FROM sync_rules ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_rule).collect()
    }

    /// Lists active rules only (the evaluation-time read).
    pub async fn list_active(&self) -> StoreResult<Vec<SyncRule>> {
        let rows = sqlx::query("SELECT * FROM sync_rules WHERE active = 1 ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_rule).collect()
    }

    /// Deletes a rule.
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_rules WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> StoreResult<SyncRule> {
    let strategy_raw: String = row.try_get("strategy")?;
    let strategy: SyncStrategy = serde_json::from_str(&strategy_raw)?;

    let scope_raw: String = row.try_get("scope")?;
    let scope: RuleScope = serde_json::from_str(&scope_raw)?;

    let targets_raw: String = row.try_get("target_accounts")?;
    let target_accounts: Vec<String> = serde_json::from_str(&targets_raw)?;

    Ok(SyncRule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        strategy,
        scope,
        target_accounts,
        active: row.try_get("active")?,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

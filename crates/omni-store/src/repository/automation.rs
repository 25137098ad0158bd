//! # Automation Rule Repository
//!
//! Tag/assign rules evaluated after order status writes.

use sqlx::{Row, SqlitePool};

use omni_core::{AutomationAction, AutomationRule, CanonicalStatus};

use crate::error::{StoreError, StoreResult};

/// Repository for automation rule operations.
#[derive(Debug, Clone)]
pub struct AutomationRepository {
    pool: SqlitePool,
}

impl AutomationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        AutomationRepository { pool }
    }

    /// Inserts a new automation rule.
    pub async fn insert(&self, rule: &AutomationRule) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO automation_rules (id, name, match_status, match_channel, action, active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(rule.match_status.map(|s| s.as_str()))
        .bind(&rule.match_channel)
        .bind(serde_json::to_string(&rule.action)?)
        .bind(rule.active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Replaces an existing automation rule.
    pub async fn update(&self, rule: &AutomationRule) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE automation_rules
            SET name = ?2, match_status = ?3, match_channel = ?4, action = ?5, active = ?6
            WHERE id = ?1
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(rule.match_status.map(|s| s.as_str()))
        .bind(&rule.match_channel)
        .bind(serde_json::to_string(&rule.action)?)
        .bind(rule.active)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "AutomationRule".to_string(),
                id: rule.id.clone(),
            });
        }

        Ok(())
    }

    /// Lists all automation rules.
    pub async fn list(&self) -> StoreResult<Vec<AutomationRule>> {
        let rows = sqlx::query("SELECT * FROM automation_rules ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_rule).collect()
    }

    /// Lists active rules only (the post-write evaluation read).
    pub async fn list_active(&self) -> StoreResult<Vec<AutomationRule>> {
        let rows = sqlx::query("SELECT * FROM automation_rules WHERE active = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_rule).collect()
    }

    /// Deletes an automation rule.
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM automation_rules WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> StoreResult<AutomationRule> {
    let match_status = match row.try_get::<Option<String>, _>("match_status")? {
        Some(raw) => Some(
            CanonicalStatus::parse(&raw)
                .ok_or_else(|| StoreError::corrupt("automation_rules", format!("status '{raw}'")))?,
        ),
        None => None,
    };

    let action_raw: String = row.try_get("action")?;
    let action: AutomationAction = serde_json::from_str(&action_raw)?;

    Ok(AutomationRule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        match_status,
        match_channel: row.try_get("match_channel")?,
        action,
        active: row.try_get("active")?,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    fn rule(id: &str, active: bool) -> AutomationRule {
        AutomationRule {
            id: id.to_string(),
            name: "tag new shopmart orders".to_string(),
            match_status: Some(CanonicalStatus::Confirmed),
            match_channel: Some("shopmart".to_string()),
            action: AutomationAction::AddTag("priority".to_string()),
            active,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_with_action_json() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.automation();

        repo.insert(&rule("ar-1", true)).await.unwrap();

        let rules = repo.list().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].match_status, Some(CanonicalStatus::Confirmed));
        assert_eq!(
            rules[0].action,
            AutomationAction::AddTag("priority".to_string())
        );
    }

    #[tokio::test]
    async fn test_active_filter() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.automation();

        repo.insert(&rule("ar-1", true)).await.unwrap();
        repo.insert(&rule("ar-2", false)).await.unwrap();

        assert_eq!(repo.list_active().await.unwrap().len(), 1);
        assert_eq!(repo.list().await.unwrap().len(), 2);
    }
}

//! # Order Repository
//!
//! Canonical orders with idempotent channel upserts. The
//! `(account_id, channel_order_id)` pair is the identity a pull dedups on:
//! re-pulling the same channel order updates the existing row and appends to
//! its timeline instead of creating a duplicate.
//!
//! Status changes are classified against the canonical lifecycle graph.
//! Anomalous changes are applied anyway (the channel is authoritative) but
//! the timeline row carries the flag.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use omni_core::{
    classify_transition, new_id, CanonicalStatus, Order, OrderItem, StatusTransition,
    TransitionClass,
};

use crate::error::{StoreError, StoreResult};

/// Outcome of an order upsert.
#[derive(Debug, Clone)]
pub struct OrderUpsert {
    /// The stored order after the write.
    pub order: Order,
    /// True when this pull created the order.
    pub created: bool,
    /// True when this write moved the order into the confirmed path for the
    /// first time. The trigger for inventory decrement, fired at most once
    /// per order.
    pub confirmed_now: bool,
    /// How the status change classified, when the status changed.
    pub transition: Option<TransitionClass>,
}

/// Repository for canonical orders and their status timelines.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        OrderRepository { pool }
    }

    /// Upserts an order pulled from a channel.
    ///
    /// New orders are inserted with an initial timeline entry. Existing
    /// orders get their items refreshed and, when the status changed, a
    /// classified timeline entry. `actor` and `reason` describe the source
    /// of the change (e.g. "channel:shopmart" and the native status string).
    pub async fn upsert(
        &self,
        incoming: &Order,
        actor: &str,
        reason: Option<&str>,
    ) -> StoreResult<OrderUpsert> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT * FROM orders WHERE account_id = ?1 AND channel_order_id = ?2",
        )
        .bind(&incoming.account_id)
        .bind(&incoming.channel_order_id)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                let mut order = incoming.clone();
                order.created_at = now;
                order.updated_at = now;

                sqlx::query(
                    r#"
                    INSERT INTO orders (
                        id, account_id, channel_code, channel_order_id, status,
                        needs_review, assigned_to, tags, items, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    "#,
                )
                .bind(&order.id)
                .bind(&order.account_id)
                .bind(&order.channel_code)
                .bind(&order.channel_order_id)
                .bind(order.status.as_str())
                .bind(order.needs_review)
                .bind(&order.assigned_to)
                .bind(serde_json::to_string(&order.tags)?)
                .bind(serde_json::to_string(&order.items)?)
                .bind(order.created_at)
                .bind(order.updated_at)
                .execute(&mut *tx)
                .await?;

                insert_transition(&mut tx, &order.id, None, order.status, actor, reason, false)
                    .await?;

                debug!(
                    order_id = %order.id,
                    channel_order_id = %order.channel_order_id,
                    status = %order.status,
                    "Created order"
                );

                let confirmed_now = enters_confirmed_path(None, order.status);
                OrderUpsert {
                    order,
                    created: true,
                    confirmed_now,
                    transition: None,
                }
            }
            Some(row) => {
                let mut order = row_to_order(&row)?;
                let previous = order.status;
                let class = classify_transition(previous, incoming.status);

                order.items = incoming.items.clone();
                order.needs_review = order.needs_review || incoming.needs_review;
                order.updated_at = now;

                let mut transition = None;
                if class != TransitionClass::Unchanged {
                    let anomalous = class == TransitionClass::Anomalous;
                    if anomalous {
                        warn!(
                            order_id = %order.id,
                            from = %previous,
                            to = %incoming.status,
                            "Anomalous order status transition"
                        );
                    }
                    order.status = incoming.status;
                    insert_transition(
                        &mut tx,
                        &order.id,
                        Some(previous),
                        incoming.status,
                        actor,
                        reason,
                        anomalous,
                    )
                    .await?;
                    transition = Some(class);
                }

                sqlx::query(
                    "UPDATE orders
                     SET status = ?2, needs_review = ?3, items = ?4, updated_at = ?5
                     WHERE id = ?1",
                )
                .bind(&order.id)
                .bind(order.status.as_str())
                .bind(order.needs_review)
                .bind(serde_json::to_string(&order.items)?)
                .bind(order.updated_at)
                .execute(&mut *tx)
                .await?;

                let confirmed_now = transition.is_some()
                    && enters_confirmed_path(Some(previous), order.status);
                OrderUpsert {
                    order,
                    created: false,
                    confirmed_now,
                    transition,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Fetches one order by internal id.
    pub async fn get(&self, id: &str) -> StoreResult<Order> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "Order".to_string(),
                id: id.to_string(),
            })?;
        row_to_order(&row)
    }

    /// Fetches one order by its channel identity.
    pub async fn get_by_channel(
        &self,
        account_id: &str,
        channel_order_id: &str,
    ) -> StoreResult<Option<Order>> {
        let row = sqlx::query(
            "SELECT * FROM orders WHERE account_id = ?1 AND channel_order_id = ?2",
        )
        .bind(account_id)
        .bind(channel_order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    /// Replaces an order's tags.
    pub async fn set_tags(&self, id: &str, tags: &[String]) -> StoreResult<()> {
        sqlx::query("UPDATE orders SET tags = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(serde_json::to_string(tags)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Assigns an order to a user.
    pub async fn assign(&self, id: &str, user: &str) -> StoreResult<()> {
        sqlx::query("UPDATE orders SET assigned_to = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(user)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flags or clears the manual review marker.
    pub async fn set_needs_review(&self, id: &str, needs_review: bool) -> StoreResult<()> {
        sqlx::query("UPDATE orders SET needs_review = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(needs_review)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Orders flagged for manual review (unmapped channel statuses).
    pub async fn list_needing_review(&self) -> StoreResult<Vec<Order>> {
        let rows = sqlx::query("SELECT * FROM orders WHERE needs_review = 1 ORDER BY updated_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_order).collect()
    }

    /// Full status timeline for an order, oldest first.
    pub async fn transitions(&self, order_id: &str) -> StoreResult<Vec<StatusTransition>> {
        let rows = sqlx::query(
            "SELECT * FROM order_transitions WHERE order_id = ?1 ORDER BY at",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let from = match row.try_get::<Option<String>, _>("from_status")? {
                    Some(raw) => Some(CanonicalStatus::parse(&raw).ok_or_else(|| {
                        StoreError::corrupt("order_transitions", format!("status '{raw}'"))
                    })?),
                    None => None,
                };
                let to_raw: String = row.try_get("to_status")?;
                let to = CanonicalStatus::parse(&to_raw).ok_or_else(|| {
                    StoreError::corrupt("order_transitions", format!("status '{to_raw}'"))
                })?;

                Ok(StatusTransition {
                    from,
                    to,
                    actor: row.try_get("actor")?,
                    reason: row.try_get("reason")?,
                    anomalous: row.try_get("anomalous")?,
                    at: row.try_get("at")?,
                })
            })
            .collect()
    }
}

/// Whether this status change moves the order into the confirmed path for
/// the first time (the inventory decrement trigger).
fn enters_confirmed_path(previous: Option<CanonicalStatus>, next: CanonicalStatus) -> bool {
    use CanonicalStatus::*;
    let in_path = |s: CanonicalStatus| matches!(s, Confirmed | Processing | Shipped | Delivered);
    in_path(next) && !previous.is_some_and(in_path)
}

async fn insert_transition(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    order_id: &str,
    from: Option<CanonicalStatus>,
    to: CanonicalStatus,
    actor: &str,
    reason: Option<&str>,
    anomalous: bool,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO order_transitions (id, order_id, from_status, to_status, actor, reason, anomalous, at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(new_id())
    .bind(order_id)
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(actor)
    .bind(reason)
    .bind(anomalous)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_order(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Order> {
    let status_raw: String = row.try_get("status")?;
    let status = CanonicalStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::corrupt("orders", format!("status '{status_raw}'")))?;

    let tags_raw: String = row.try_get("tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_raw)?;

    let items_raw: String = row.try_get("items")?;
    let items: Vec<OrderItem> = serde_json::from_str(&items_raw)?;

    Ok(Order {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        channel_code: row.try_get("channel_code")?,
        channel_order_id: row.try_get("channel_order_id")?,
        status,
        needs_review: row.try_get("needs_review")?,
        assigned_to: row.try_get("assigned_to")?,
        tags,
        items,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    fn incoming(channel_order_id: &str, status: CanonicalStatus) -> Order {
        Order {
            id: new_id(),
            account_id: "acc-1".to_string(),
            channel_code: "shopmart".to_string(),
            channel_order_id: channel_order_id.to_string(),
            status,
            needs_review: false,
            assigned_to: None,
            tags: vec![],
            items: vec![OrderItem {
                product_ref: "SKU-1".to_string(),
                quantity: 2,
                unit_price_cents: 1999,
            }],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_repull_does_not_duplicate() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let orders = db.orders();

        let first = orders
            .upsert(&incoming("SM-1001", CanonicalStatus::Pending), "channel:shopmart", None)
            .await
            .unwrap();
        assert!(first.created);

        let second = orders
            .upsert(&incoming("SM-1001", CanonicalStatus::Pending), "channel:shopmart", None)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.order.id, first.order.id);
        assert_eq!(second.transition, None);

        // Unchanged re-pull adds no timeline entry past the initial one.
        assert_eq!(orders.transitions(&first.order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_confirmed_fires_exactly_once() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let orders = db.orders();

        let pending = orders
            .upsert(&incoming("SM-1001", CanonicalStatus::Pending), "channel:shopmart", None)
            .await
            .unwrap();
        assert!(!pending.confirmed_now);

        let confirmed = orders
            .upsert(
                &incoming("SM-1001", CanonicalStatus::Confirmed),
                "channel:shopmart",
                Some("paid"),
            )
            .await
            .unwrap();
        assert!(confirmed.confirmed_now);
        assert_eq!(confirmed.transition, Some(TransitionClass::Forward));

        // Later forward progress does not re-fire.
        let shipped = orders
            .upsert(&incoming("SM-1001", CanonicalStatus::Shipped), "channel:shopmart", None)
            .await
            .unwrap();
        assert!(!shipped.confirmed_now);
    }

    #[tokio::test]
    async fn test_new_order_already_confirmed_fires() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let orders = db.orders();

        let result = orders
            .upsert(&incoming("SM-2002", CanonicalStatus::Shipped), "channel:shopmart", None)
            .await
            .unwrap();
        assert!(result.created);
        assert!(result.confirmed_now);
    }

    #[tokio::test]
    async fn test_anomalous_transition_applied_and_flagged() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let orders = db.orders();

        orders
            .upsert(&incoming("SM-1001", CanonicalStatus::Shipped), "channel:shopmart", None)
            .await
            .unwrap();
        let reverted = orders
            .upsert(&incoming("SM-1001", CanonicalStatus::Pending), "channel:shopmart", None)
            .await
            .unwrap();

        assert_eq!(reverted.transition, Some(TransitionClass::Anomalous));
        assert_eq!(reverted.order.status, CanonicalStatus::Pending);

        let timeline = orders.transitions(&reverted.order.id).await.unwrap();
        assert_eq!(timeline.len(), 2);
        assert!(timeline[1].anomalous);
        assert_eq!(timeline[1].from, Some(CanonicalStatus::Shipped));
    }

    #[tokio::test]
    async fn test_tags_and_assignment() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let orders = db.orders();

        let created = orders
            .upsert(&incoming("SM-1001", CanonicalStatus::Confirmed), "channel:shopmart", None)
            .await
            .unwrap();

        orders
            .set_tags(&created.order.id, &["priority".to_string()])
            .await
            .unwrap();
        orders.assign(&created.order.id, "sam").await.unwrap();

        let fetched = orders.get(&created.order.id).await.unwrap();
        assert_eq!(fetched.tags, vec!["priority".to_string()]);
        assert_eq!(fetched.assigned_to.as_deref(), Some("sam"));
    }

    #[tokio::test]
    async fn test_needs_review_listing() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let orders = db.orders();

        let mut flagged = incoming("SM-1001", CanonicalStatus::Pending);
        flagged.needs_review = true;
        orders.upsert(&flagged, "channel:shopmart", None).await.unwrap();
        orders
            .upsert(&incoming("SM-1002", CanonicalStatus::Pending), "channel:shopmart", None)
            .await
            .unwrap();

        let review = orders.list_needing_review().await.unwrap();
        assert_eq!(review.len(), 1);
        assert_eq!(review[0].channel_order_id, "SM-1001");
    }
}

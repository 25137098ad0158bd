//! # Job Backlog Repository
//!
//! The durable work queue. Jobs survive process restart; a fresh engine picks
//! up QUEUED rows exactly where the previous process left them.
//!
//! ## Claim Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Worker Claim (compare-and-set)                      │
//! │                                                                         │
//! │   SELECT oldest runnable QUEUED job for queue                           │
//! │       (run_at <= now, ORDER BY priority DESC, run_at ASC)               │
//! │            │                                                            │
//! │            ▼                                                            │
//! │   UPDATE ... SET status = 'active' WHERE id = ? AND status = 'queued'   │
//! │            │                                                            │
//! │            ├── rows_affected = 1 ──► job is ours                        │
//! │            └── rows_affected = 0 ──► lost the race, try again           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dedup Coalescing
//! At most one QUEUED job exists per dedup key. Enqueueing against an
//! existing QUEUED match refreshes its payload in place (latest wins) and
//! returns the existing id. An ACTIVE match does not block a new job: the
//! running attempt may already have read stale state.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use omni_core::{new_id, JobKind, JobStatus, QueueName, SyncJob};

use crate::error::{StoreError, StoreResult};

/// Parameters for enqueueing a job. Fields not set keep their defaults.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub kind: JobKind,
    pub payload: String,
    pub priority: i64,
    pub max_attempts: i64,
    pub dedup_key: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn new(kind: JobKind, payload: impl Into<String>) -> Self {
        EnqueueOptions {
            kind,
            payload: payload.into(),
            priority: 0,
            max_attempts: 3,
            dedup_key: None,
            run_at: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }
}

/// Repository for the durable job backlog.
#[derive(Debug, Clone)]
pub struct JobRepository {
    pool: SqlitePool,
}

impl JobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        JobRepository { pool }
    }

    /// Enqueues a job, coalescing into an existing QUEUED job when the dedup
    /// key matches one. Returns the id of the job that will run.
    pub async fn enqueue(&self, opts: EnqueueOptions) -> StoreResult<String> {
        let now = Utc::now();
        let run_at = opts.run_at.unwrap_or(now);
        let mut tx = self.pool.begin().await?;

        if let Some(ref key) = opts.dedup_key {
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT id FROM sync_jobs WHERE dedup_key = ?1 AND status = 'queued'",
            )
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(id) = existing {
                // Latest wins: the pending job will read current state anyway,
                // but the payload may carry fresher context.
                sqlx::query(
                    "UPDATE sync_jobs SET payload = ?2, priority = MAX(priority, ?3)
                     WHERE id = ?1",
                )
                .bind(&id)
                .bind(&opts.payload)
                .bind(opts.priority)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                debug!(job_id = %id, dedup_key = %key, "Coalesced into queued job");
                return Ok(id);
            }
        }

        let id = new_id();
        sqlx::query(
            r#"
            INSERT INTO sync_jobs (
                id, queue, kind, payload, status, attempts, max_attempts,
                priority, dedup_key, run_at, stall_count, created_at
            ) VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, ?7, ?8, 0, ?9)
            "#,
        )
        .bind(&id)
        .bind(opts.kind.queue().as_str())
        .bind(opts.kind.as_str())
        .bind(&opts.payload)
        .bind(opts.max_attempts)
        .bind(opts.priority)
        .bind(&opts.dedup_key)
        .bind(run_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(job_id = %id, kind = %opts.kind, queue = %opts.kind.queue(), "Enqueued job");
        Ok(id)
    }

    /// Claims the next runnable job on a queue, or None when the queue is
    /// empty. The claim is a compare-and-set on status so concurrent workers
    /// never double-claim.
    pub async fn claim_next(&self, queue: QueueName) -> StoreResult<Option<SyncJob>> {
        let now = Utc::now();

        let row = sqlx::query(
            "SELECT * FROM sync_jobs
             WHERE queue = ?1 AND status = 'queued' AND run_at <= ?2
             ORDER BY priority DESC, run_at ASC
             LIMIT 1",
        )
        .bind(queue.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = row_to_job(&row)?;

        let claimed = sqlx::query(
            "UPDATE sync_jobs SET status = 'active', heartbeat_at = ?2
             WHERE id = ?1 AND status = 'queued'",
        )
        .bind(&job.id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if claimed.rows_affected() == 0 {
            // Another worker got there first.
            return Ok(None);
        }

        job.status = JobStatus::Active;
        job.heartbeat_at = Some(now);
        Ok(Some(job))
    }

    /// Records worker progress on an active job.
    pub async fn heartbeat(&self, id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE sync_jobs SET heartbeat_at = ?2 WHERE id = ?1 AND status = 'active'")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Marks a job completed. Counts the executed attempt.
    pub async fn complete(&self, id: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE sync_jobs
             SET status = 'completed', attempts = attempts + 1,
                 completed_at = ?2, last_error = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Requeues a job for a retry after a transient failure. Counts the
    /// executed attempt and schedules the next one at `run_at`.
    pub async fn retry(&self, id: &str, run_at: DateTime<Utc>, error: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE sync_jobs
             SET status = 'queued', attempts = attempts + 1,
                 run_at = ?2, last_error = ?3, heartbeat_at = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Requeues a job without counting an attempt. Used when the governor
    /// denied the slot: no channel call executed, so the budget is untouched.
    pub async fn reschedule(&self, id: &str, run_at: DateTime<Utc>, reason: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE sync_jobs
             SET status = 'queued', run_at = ?2, last_error = ?3, heartbeat_at = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .bind(run_at)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Marks a job terminally failed. Counts the executed attempt.
    pub async fn fail(&self, id: &str, error: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE sync_jobs
             SET status = 'failed', attempts = attempts + 1,
                 completed_at = ?2, last_error = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(Utc::now())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recovers jobs whose worker stopped heartbeating before `cutoff`.
    ///
    /// Overdue active rows move to `stalled` first, then each stalled row is
    /// resolved: first stall requeues the job immediately (stall_count = 1),
    /// a second stall fails it terminally. A scan interrupted between the
    /// two steps leaves rows in `stalled`, which the next scan resolves.
    /// Returns (requeued ids, failed ids).
    pub async fn requeue_stalled(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<(Vec<String>, Vec<String>)> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            "UPDATE sync_jobs SET status = 'stalled'
             WHERE status = 'active' AND (heartbeat_at IS NULL OR heartbeat_at < ?1)",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query("SELECT id, stall_count FROM sync_jobs WHERE status = 'stalled'")
            .fetch_all(&mut *tx)
            .await?;

        let mut requeued = Vec::new();
        let mut failed = Vec::new();

        for row in &rows {
            let id: String = row.try_get("id")?;
            let stall_count: i64 = row.try_get("stall_count")?;

            if stall_count == 0 {
                sqlx::query(
                    "UPDATE sync_jobs
                     SET status = 'queued', stall_count = 1, run_at = ?2,
                         heartbeat_at = NULL, last_error = 'worker stalled'
                     WHERE id = ?1",
                )
                .bind(&id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                warn!(job_id = %id, "Requeued stalled job");
                requeued.push(id);
            } else {
                sqlx::query(
                    "UPDATE sync_jobs
                     SET status = 'failed', completed_at = ?2,
                         last_error = 'worker stalled twice'
                     WHERE id = ?1",
                )
                .bind(&id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                warn!(job_id = %id, "Failed repeatedly stalling job");
                failed.push(id);
            }
        }

        tx.commit().await?;
        Ok((requeued, failed))
    }

    /// Fetches one job by id.
    pub async fn get(&self, id: &str) -> StoreResult<SyncJob> {
        let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "SyncJob".to_string(),
                id: id.to_string(),
            })?;

        row_to_job(&row)
    }

    /// Counts jobs per status (queue depth gauge).
    pub async fn count_by_status(&self) -> StoreResult<Vec<(JobStatus, i64)>> {
        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM sync_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = Vec::new();
        for row in &rows {
            let raw: String = row.try_get("status")?;
            let status = JobStatus::parse(&raw)
                .ok_or_else(|| StoreError::corrupt("sync_jobs", format!("status '{raw}'")))?;
            counts.push((status, row.try_get("n")?));
        }
        Ok(counts)
    }

    /// Cancels QUEUED jobs whose dedup key starts with `prefix` (e.g. all
    /// pending pushes targeting a disconnected account). Active jobs finish
    /// their attempt. Returns the number cancelled.
    pub async fn cancel_queued_matching(&self, prefix: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE sync_jobs
             SET status = 'failed', completed_at = ?2, last_error = 'cancelled'
             WHERE status = 'queued' AND dedup_key LIKE ?1 || '%'",
        )
        .bind(prefix)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deletes terminal jobs older than `before` (retention sweep).
    pub async fn prune_terminal(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM sync_jobs
             WHERE status IN ('completed', 'failed') AND completed_at < ?1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> StoreResult<SyncJob> {
    let queue_raw: String = row.try_get("queue")?;
    let queue = QueueName::parse(&queue_raw)
        .ok_or_else(|| StoreError::corrupt("sync_jobs", format!("queue '{queue_raw}'")))?;

    let kind_raw: String = row.try_get("kind")?;
    let kind = JobKind::parse(&kind_raw)
        .ok_or_else(|| StoreError::corrupt("sync_jobs", format!("kind '{kind_raw}'")))?;

    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::corrupt("sync_jobs", format!("status '{status_raw}'")))?;

    Ok(SyncJob {
        id: row.try_get("id")?,
        queue,
        kind,
        payload: row.try_get("payload")?,
        status,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        priority: row.try_get("priority")?,
        dedup_key: row.try_get("dedup_key")?,
        run_at: row.try_get("run_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        stall_count: row.try_get("stall_count")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::Duration;

    fn opts(payload: &str) -> EnqueueOptions {
        EnqueueOptions::new(JobKind::SyncStock, payload)
    }

    #[tokio::test]
    async fn test_enqueue_and_claim() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let jobs = db.jobs();

        let id = jobs.enqueue(opts(r#"{"product_ref":"SKU-1"}"#)).await.unwrap();

        let claimed = jobs.claim_next(QueueName::Stock).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert!(claimed.heartbeat_at.is_some());

        // Nothing else to claim.
        assert!(jobs.claim_next(QueueName::Stock).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dedup_coalesces_queued_job() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let jobs = db.jobs();

        let first = jobs
            .enqueue(opts("v1").dedup_key("SKU-1:acc-1"))
            .await
            .unwrap();
        let second = jobs
            .enqueue(opts("v2").dedup_key("SKU-1:acc-1"))
            .await
            .unwrap();

        assert_eq!(first, second);
        let job = jobs.get(&first).await.unwrap();
        assert_eq!(job.payload, "v2");
    }

    #[tokio::test]
    async fn test_dedup_does_not_coalesce_active_job() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let jobs = db.jobs();

        let first = jobs
            .enqueue(opts("v1").dedup_key("SKU-1:acc-1"))
            .await
            .unwrap();
        jobs.claim_next(QueueName::Stock).await.unwrap().unwrap();

        let second = jobs
            .enqueue(opts("v2").dedup_key("SKU-1:acc-1"))
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_future_run_at_is_not_claimable() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let jobs = db.jobs();

        jobs.enqueue(opts("x").run_at(Utc::now() + Duration::minutes(5)))
            .await
            .unwrap();

        assert!(jobs.claim_next(QueueName::Stock).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let jobs = db.jobs();

        jobs.enqueue(opts("low")).await.unwrap();
        let high = jobs.enqueue(opts("high").priority(10)).await.unwrap();

        let claimed = jobs.claim_next(QueueName::Stock).await.unwrap().unwrap();
        assert_eq!(claimed.id, high);
    }

    #[tokio::test]
    async fn test_retry_counts_attempt_reschedule_does_not() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let jobs = db.jobs();

        let id = jobs.enqueue(opts("x")).await.unwrap();
        jobs.claim_next(QueueName::Stock).await.unwrap().unwrap();
        jobs.retry(&id, Utc::now(), "connection reset").await.unwrap();
        assert_eq!(jobs.get(&id).await.unwrap().attempts, 1);

        jobs.claim_next(QueueName::Stock).await.unwrap().unwrap();
        jobs.reschedule(&id, Utc::now(), "rate limited").await.unwrap();

        let job = jobs.get(&id).await.unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_complete_and_fail_are_terminal() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let jobs = db.jobs();

        let a = jobs.enqueue(opts("a")).await.unwrap();
        jobs.claim_next(QueueName::Stock).await.unwrap().unwrap();
        jobs.complete(&a).await.unwrap();

        let done = jobs.get(&a).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempts, 1);
        assert!(done.completed_at.is_some());

        let b = jobs.enqueue(opts("b")).await.unwrap();
        jobs.claim_next(QueueName::Stock).await.unwrap().unwrap();
        jobs.fail(&b, "invalid sku").await.unwrap();

        let dead = jobs.get(&b).await.unwrap();
        assert_eq!(dead.status, JobStatus::Failed);
        assert_eq!(dead.last_error.as_deref(), Some("invalid sku"));
    }

    #[tokio::test]
    async fn test_stall_requeues_once_then_fails() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let jobs = db.jobs();

        let id = jobs.enqueue(opts("x")).await.unwrap();
        jobs.claim_next(QueueName::Stock).await.unwrap().unwrap();

        // First sweep: heartbeat is "old" relative to a future cutoff.
        let cutoff = Utc::now() + Duration::seconds(1);
        let (requeued, failed) = jobs.requeue_stalled(cutoff).await.unwrap();
        assert_eq!(requeued, vec![id.clone()]);
        assert!(failed.is_empty());
        assert_eq!(jobs.get(&id).await.unwrap().stall_count, 1);

        // Second stall of the same job fails it.
        jobs.claim_next(QueueName::Stock).await.unwrap().unwrap();
        let cutoff = Utc::now() + Duration::seconds(1);
        let (requeued, failed) = jobs.requeue_stalled(cutoff).await.unwrap();
        assert!(requeued.is_empty());
        assert_eq!(failed, vec![id.clone()]);
        assert_eq!(jobs.get(&id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_stalled_rows_from_interrupted_sweep_are_resolved() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let jobs = db.jobs();

        let id = jobs.enqueue(opts("x")).await.unwrap();
        jobs.claim_next(QueueName::Stock).await.unwrap().unwrap();

        // Simulate a sweep that marked the row and died before resolving it.
        sqlx::query("UPDATE sync_jobs SET status = 'stalled' WHERE id = ?1")
            .bind(&id)
            .execute(db.pool())
            .await
            .unwrap();

        // A fresh heartbeat elsewhere is irrelevant; the marked row itself
        // gets the requeue-once treatment.
        let cutoff = Utc::now() - Duration::seconds(60);
        let (requeued, failed) = jobs.requeue_stalled(cutoff).await.unwrap();
        assert_eq!(requeued, vec![id.clone()]);
        assert!(failed.is_empty());

        let job = jobs.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stall_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_matching() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let jobs = db.jobs();

        jobs.enqueue(opts("a").dedup_key("SKU-1:acc-1")).await.unwrap();
        jobs.enqueue(opts("b").dedup_key("SKU-2:acc-2")).await.unwrap();

        let n = jobs.cancel_queued_matching("SKU-1:").await.unwrap();
        assert_eq!(n, 1);
        assert!(jobs.claim_next(QueueName::Stock).await.unwrap().is_some());
        assert!(jobs.claim_next(QueueName::Stock).await.unwrap().is_none());
    }
}

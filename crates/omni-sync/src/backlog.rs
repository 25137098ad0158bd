//! # Job Backlog
//!
//! Worker pools over the durable job queue, plus the retry policy and stall
//! recovery. Handlers implement the work; the backlog owns everything about
//! when and how often they run.
//!
//! ## Attempt Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        One Worker Iteration                             │
//! │                                                                         │
//! │   claim_next(queue) ──► handler.execute(job) under the deadline,        │
//! │            │            heartbeating so the stall scanner can tell      │
//! │            │            a slow job from a dead worker                   │
//! │            │                                                            │
//! │            ├── Ok ───────────► complete + ledger(success, terminal)     │
//! │            │                                                            │
//! │            ├── RateLimited ──► reschedule after window                  │
//! │            │                   (no attempt, no ledger entry)            │
//! │            │                                                            │
//! │            ├── Transient ────► attempts left?                           │
//! │            │                    yes: retry at base·2^n + jitter         │
//! │            │                         + ledger(failure)                  │
//! │            │                    no:  fail + ledger(failure, terminal)   │
//! │            │                                                            │
//! │            └── Auth/Rejected ► fail + ledger(failure, terminal)         │
//! │                                (Auth also flags the account)            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use omni_core::{new_id, ConnectionState, JobKind, LedgerEntry, QueueName, SyncJob};
use omni_store::{Database, EnqueueOptions};

use crate::config::{RetrySettings, SchedulerSettings, WorkerSettings};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Handler Trait
// =============================================================================

/// What a ledger entry should say about a job, derived from its payload.
#[derive(Debug, Clone, Default)]
pub struct LedgerContext {
    pub account_id: Option<String>,
    pub product_ref: Option<String>,
    pub quantity: Option<i64>,
}

/// One implementation per [`JobKind`]. Handlers must be idempotent: a stalled
/// job is re-executed from the start, and a crash between the channel call
/// and the completion write replays the attempt.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    /// The kind this handler serves.
    fn kind(&self) -> JobKind;

    /// Best-effort payload description for ledger entries. Must not fail;
    /// an unparseable payload just yields an empty context.
    fn describe(&self, job: &SyncJob) -> LedgerContext;

    /// Executes one attempt.
    async fn execute(&self, job: &SyncJob) -> SyncResult<()>;
}

// =============================================================================
// Backlog
// =============================================================================

/// Worker pools, retry policy, and stall recovery over the persistent queue.
pub struct JobBacklog {
    db: Arc<Database>,
    retry: RetrySettings,
    scheduler: SchedulerSettings,
    workers: WorkerSettings,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobBacklog {
    pub fn new(
        db: Arc<Database>,
        retry: RetrySettings,
        scheduler: SchedulerSettings,
        workers: WorkerSettings,
    ) -> Self {
        JobBacklog {
            db,
            retry,
            scheduler,
            workers,
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler. Must happen before `spawn`.
    pub fn register_handler(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Enqueues work, applying the configured default attempt budget.
    pub async fn enqueue(&self, mut opts: EnqueueOptions) -> SyncResult<String> {
        if opts.max_attempts <= 0 {
            opts.max_attempts = self.retry.default_max_attempts;
        }
        Ok(self.db.jobs().enqueue(opts).await?)
    }

    /// Spawns worker pools for every queue plus the stall scanner. Workers
    /// drain in-flight jobs and exit when `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for queue in QueueName::all() {
            for worker in 0..self.workers.count_for(queue) {
                let backlog = Arc::clone(&self);
                let mut shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    debug!(queue = %queue, worker, "Worker starting");
                    let poll = Duration::from_millis(backlog.scheduler.poll_interval_ms);
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        match backlog.process_one(queue).await {
                            Ok(true) => continue,
                            Ok(false) => {
                                tokio::select! {
                                    _ = tokio::time::sleep(poll) => {}
                                    _ = shutdown.changed() => {}
                                }
                            }
                            Err(e) => {
                                error!(queue = %queue, error = %e, "Worker iteration failed");
                                tokio::time::sleep(poll).await;
                            }
                        }
                    }
                    debug!(queue = %queue, worker, "Worker stopped");
                }));
            }
        }

        // Stall scanner.
        {
            let backlog = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let interval = Duration::from_secs(backlog.scheduler.stall_check_interval_secs);
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = backlog.recover_stalled().await {
                                error!(error = %e, "Stall scan failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        info!("Job backlog workers started");
        handles
    }

    /// Claims and executes at most one job on `queue`. Returns whether a job
    /// was found. Exposed for tests that drive queues deterministically.
    pub async fn process_one(&self, queue: QueueName) -> SyncResult<bool> {
        let Some(job) = self.db.jobs().claim_next(queue).await? else {
            return Ok(false);
        };
        self.execute_claimed(job).await?;
        Ok(true)
    }

    /// Scans for stalled jobs and applies the requeue-once policy.
    pub async fn recover_stalled(&self) -> SyncResult<()> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.scheduler.stall_timeout_secs as i64);
        let (requeued, failed) = self.db.jobs().requeue_stalled(cutoff).await?;
        if !requeued.is_empty() || !failed.is_empty() {
            info!(
                requeued = requeued.len(),
                failed = failed.len(),
                "Recovered stalled jobs"
            );
        }
        Ok(())
    }

    async fn execute_claimed(&self, job: SyncJob) -> SyncResult<()> {
        let Some(handler) = self.handlers.get(&job.kind) else {
            let err = SyncError::HandlerNotRegistered(job.kind.to_string());
            error!(job_id = %job.id, kind = %job.kind, "{err}");
            self.db.jobs().fail(&job.id, &err.to_string()).await?;
            return Ok(());
        };
        let handler = Arc::clone(handler);

        let attempt = job.attempts + 1;
        let result = self.run_with_heartbeat(&handler, &job).await;

        let context = handler.describe(&job);
        match result {
            Ok(()) => {
                self.db.jobs().complete(&job.id).await?;
                self.write_ledger(&job, &context, attempt, true, true, None)
                    .await?;
                debug!(job_id = %job.id, kind = %job.kind, attempt, "Job completed");
            }
            Err(SyncError::RateLimited { retry_after_secs }) => {
                // No call executed: reschedule without touching the attempt
                // budget and without a ledger entry.
                let run_at = Utc::now() + ChronoDuration::seconds(retry_after_secs as i64);
                self.db
                    .jobs()
                    .reschedule(&job.id, run_at, "rate limited")
                    .await?;
                debug!(job_id = %job.id, retry_after_secs, "Job rescheduled past rate window");
            }
            Err(e) if e.is_retryable() && attempt < job.max_attempts => {
                let delay = self.backoff_delay(attempt);
                let run_at = Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default();
                self.db.jobs().retry(&job.id, run_at, &e.to_string()).await?;
                self.write_ledger(&job, &context, attempt, false, false, Some(&e))
                    .await?;
                warn!(
                    job_id = %job.id,
                    kind = %job.kind,
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Job attempt failed, retrying"
                );
            }
            Err(e) => {
                self.db.jobs().fail(&job.id, &e.to_string()).await?;
                self.write_ledger(&job, &context, attempt, false, true, Some(&e))
                    .await?;
                warn!(job_id = %job.id, kind = %job.kind, attempt, error = %e, "Job failed terminally");

                if let SyncError::Auth { ref account_id, .. } = e {
                    // Stop routing traffic to the account until re-auth.
                    self.db
                        .accounts()
                        .set_state(account_id, ConnectionState::Error)
                        .await?;
                    warn!(account_id = %account_id, "Account flagged for re-authentication");
                }
            }
        }

        Ok(())
    }

    /// Runs one attempt under the execution deadline, heartbeating the job
    /// row so the stall scanner never mistakes a slow running job for a dead
    /// worker's orphan.
    async fn run_with_heartbeat(
        &self,
        handler: &Arc<dyn JobHandler>,
        job: &SyncJob,
    ) -> SyncResult<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.retry.job_timeout_secs);
        let beat = Duration::from_secs((self.scheduler.stall_timeout_secs / 3).max(1));
        let mut ticker = tokio::time::interval(beat);
        // The first tick fires immediately; claim_next already stamped one.
        ticker.tick().await;

        let exec = handler.execute(job);
        tokio::pin!(exec);
        loop {
            tokio::select! {
                result = &mut exec => return result,
                _ = ticker.tick() => {
                    if let Err(e) = self.db.jobs().heartbeat(&job.id).await {
                        warn!(job_id = %job.id, error = %e, "Heartbeat write failed");
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(SyncError::Timeout(self.retry.job_timeout_secs));
                }
            }
        }
    }

    async fn write_ledger(
        &self,
        job: &SyncJob,
        context: &LedgerContext,
        attempt: i64,
        success: bool,
        terminal: bool,
        error: Option<&SyncError>,
    ) -> SyncResult<()> {
        // Notification delivery is not a sync operation; keep it out of the
        // audit trail.
        if job.kind == JobKind::Notify {
            return Ok(());
        }

        let entry = LedgerEntry {
            id: new_id(),
            job_id: job.id.clone(),
            kind: job.kind,
            account_id: context.account_id.clone(),
            product_ref: context.product_ref.clone(),
            quantity: context.quantity,
            attempt,
            success,
            terminal,
            error: error.map(ToString::to_string),
            created_at: Utc::now(),
        };
        self.db.ledger().append(&entry).await?;
        Ok(())
    }

    fn backoff_delay(&self, attempt: i64) -> Duration {
        backoff_delay(&self.retry, attempt)
    }
}

/// Exponential backoff with jitter, capped at the configured maximum.
fn backoff_delay(retry: &RetrySettings, attempt: i64) -> Duration {
    let base = retry.base_backoff_secs;
    let shift = attempt.clamp(0, 16) as u32;
    let exponential = base.saturating_mul(1u64 << shift);
    let jitter = rand::thread_rng().gen_range(0..=base);
    let secs = exponential
        .saturating_add(jitter)
        .min(retry.max_backoff_secs);
    Duration::from_secs(secs)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use omni_core::JobStatus;
    use omni_store::DbConfig;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Handler that fails with scripted errors, then succeeds.
    struct ScriptedHandler {
        kind: JobKind,
        failures: Mutex<VecDeque<SyncError>>,
        executions: Mutex<u32>,
    }

    impl ScriptedHandler {
        fn new(kind: JobKind, failures: Vec<SyncError>) -> Self {
            ScriptedHandler {
                kind,
                failures: Mutex::new(failures.into()),
                executions: Mutex::new(0),
            }
        }

        fn executions(&self) -> u32 {
            *self.executions.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl JobHandler for ScriptedHandler {
        fn kind(&self) -> JobKind {
            self.kind
        }

        fn describe(&self, _job: &SyncJob) -> LedgerContext {
            LedgerContext {
                account_id: Some("acc-1".into()),
                product_ref: Some("SKU-1".into()),
                quantity: Some(80),
            }
        }

        async fn execute(&self, _job: &SyncJob) -> SyncResult<()> {
            *self.executions.lock().unwrap() += 1;
            match self.failures.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn fast_retry() -> RetrySettings {
        RetrySettings {
            base_backoff_secs: 1,
            max_backoff_secs: 2,
            default_max_attempts: 3,
            job_timeout_secs: 5,
        }
    }

    async fn backlog_with(
        handler: Arc<ScriptedHandler>,
    ) -> (Arc<Database>, JobBacklog) {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let mut backlog = JobBacklog::new(
            Arc::clone(&db),
            fast_retry(),
            SchedulerSettings::default(),
            WorkerSettings::default(),
        );
        backlog.register_handler(handler);
        (db, backlog)
    }

    #[tokio::test]
    async fn test_success_writes_terminal_ledger_entry() {
        let handler = Arc::new(ScriptedHandler::new(JobKind::PushStockTarget, vec![]));
        let (db, backlog) = backlog_with(Arc::clone(&handler)).await;

        let id = backlog
            .enqueue(EnqueueOptions::new(JobKind::PushStockTarget, "{}"))
            .await
            .unwrap();
        assert!(backlog.process_one(QueueName::Push).await.unwrap());

        let job = db.jobs().get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);

        let entries = db.ledger().for_job(&id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert!(entries[0].terminal);
        assert_eq!(entries[0].quantity, Some(80));
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let handler = Arc::new(ScriptedHandler::new(
            JobKind::PushStockTarget,
            vec![
                SyncError::Transient("reset".into()),
                SyncError::Transient("reset".into()),
            ],
        ));
        let (db, backlog) = backlog_with(Arc::clone(&handler)).await;

        let id = backlog
            .enqueue(EnqueueOptions::new(JobKind::PushStockTarget, "{}"))
            .await
            .unwrap();

        // Drive the queue, clearing run_at so retries are immediately
        // claimable without sleeping through the backoff.
        for _ in 0..3 {
            db.jobs().reschedule(&id, Utc::now(), "test").await.ok();
            backlog.process_one(QueueName::Push).await.unwrap();
        }

        assert_eq!(handler.executions(), 3);
        let job = db.jobs().get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);

        // Three attempts, exactly one terminal.
        let entries = db.ledger().for_job(&id).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.iter().filter(|e| e.terminal).count(), 1);
        assert!(entries[2].success && entries[2].terminal);
    }

    #[tokio::test]
    async fn test_attempt_exhaustion_fails_terminally() {
        let handler = Arc::new(ScriptedHandler::new(
            JobKind::PushStockTarget,
            vec![
                SyncError::Transient("reset".into()),
                SyncError::Transient("reset".into()),
                SyncError::Transient("reset".into()),
            ],
        ));
        let (db, backlog) = backlog_with(Arc::clone(&handler)).await;

        let id = backlog
            .enqueue(EnqueueOptions::new(JobKind::PushStockTarget, "{}"))
            .await
            .unwrap();

        for _ in 0..3 {
            db.jobs().reschedule(&id, Utc::now(), "test").await.ok();
            backlog.process_one(QueueName::Push).await.unwrap();
        }

        let job = db.jobs().get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);

        let entries = db.ledger().for_job(&id).await.unwrap();
        assert_eq!(entries.len(), 3);
        let terminal: Vec<_> = entries.iter().filter(|e| e.terminal).collect();
        assert_eq!(terminal.len(), 1);
        assert!(!terminal[0].success);
    }

    #[tokio::test]
    async fn test_rejected_fails_without_retry() {
        let handler = Arc::new(ScriptedHandler::new(
            JobKind::PushStockTarget,
            vec![SyncError::Rejected("unknown sku".into())],
        ));
        let (db, backlog) = backlog_with(Arc::clone(&handler)).await;

        let id = backlog
            .enqueue(EnqueueOptions::new(JobKind::PushStockTarget, "{}"))
            .await
            .unwrap();
        backlog.process_one(QueueName::Push).await.unwrap();

        assert_eq!(handler.executions(), 1);
        let job = db.jobs().get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_reschedules_without_attempt_or_ledger() {
        let handler = Arc::new(ScriptedHandler::new(
            JobKind::PushStockTarget,
            vec![SyncError::RateLimited { retry_after_secs: 30 }],
        ));
        let (db, backlog) = backlog_with(Arc::clone(&handler)).await;

        let id = backlog
            .enqueue(EnqueueOptions::new(JobKind::PushStockTarget, "{}"))
            .await
            .unwrap();
        backlog.process_one(QueueName::Push).await.unwrap();

        let job = db.jobs().get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.run_at > Utc::now() + ChronoDuration::seconds(20));
        assert!(db.ledger().for_job(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_flags_account() {
        use omni_core::{ChannelAccount, RateLimitProfile};

        let handler = Arc::new(ScriptedHandler::new(
            JobKind::PushStockTarget,
            vec![SyncError::Auth {
                account_id: "acc-1".into(),
                detail: "token expired".into(),
            }],
        ));
        let (db, backlog) = backlog_with(Arc::clone(&handler)).await;

        db.accounts()
            .insert(&ChannelAccount {
                id: "acc-1".into(),
                channel_code: "shopmart".into(),
                display_name: "Shopmart".into(),
                connection_state: ConnectionState::Connected,
                last_synced_at: None,
                rate_profile: RateLimitProfile::default(),
                enabled: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        backlog
            .enqueue(EnqueueOptions::new(JobKind::PushStockTarget, "{}"))
            .await
            .unwrap();
        backlog.process_one(QueueName::Push).await.unwrap();

        let account = db.accounts().get("acc-1").await.unwrap();
        assert_eq!(account.connection_state, ConnectionState::Error);
    }

    /// Handler that just takes a while.
    struct SlowHandler {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl JobHandler for SlowHandler {
        fn kind(&self) -> JobKind {
            JobKind::PushStockTarget
        }

        fn describe(&self, _job: &SyncJob) -> LedgerContext {
            LedgerContext::default()
        }

        async fn execute(&self, _job: &SyncJob) -> SyncResult<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_running_job_heartbeats_past_stall_window() {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let scheduler = SchedulerSettings {
            stall_timeout_secs: 3, // one beat per second
            ..Default::default()
        };
        let mut backlog = JobBacklog::new(
            Arc::clone(&db),
            fast_retry(),
            scheduler,
            WorkerSettings::default(),
        );
        backlog.register_handler(Arc::new(SlowHandler {
            delay: Duration::from_millis(1500),
        }));

        let id = backlog
            .enqueue(EnqueueOptions::new(JobKind::PushStockTarget, "{}"))
            .await
            .unwrap();

        let started = Utc::now();
        backlog.process_one(QueueName::Push).await.unwrap();

        // The attempt outlived the claim-time stamp; the in-flight beat
        // refreshed it, so a concurrent stall scan leaves the job alone.
        let job = db.jobs().get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let beat_at = job.heartbeat_at.expect("heartbeat stamped");
        assert!(beat_at >= started + ChronoDuration::milliseconds(900));
    }

    #[tokio::test]
    async fn test_deadline_overrun_counts_as_timeout() {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let retry = RetrySettings {
            job_timeout_secs: 1,
            ..fast_retry()
        };
        let mut backlog = JobBacklog::new(
            Arc::clone(&db),
            retry,
            SchedulerSettings::default(),
            WorkerSettings::default(),
        );
        backlog.register_handler(Arc::new(SlowHandler {
            delay: Duration::from_secs(10),
        }));

        let id = backlog
            .enqueue(EnqueueOptions::new(JobKind::PushStockTarget, "{}"))
            .await
            .unwrap();
        backlog.process_one(QueueName::Push).await.unwrap();

        // Timeouts are retryable and there is attempt budget left.
        let job = db.jobs().get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetrySettings {
            base_backoff_secs: 5,
            max_backoff_secs: 300,
            default_max_attempts: 3,
            job_timeout_secs: 60,
        };

        // Jitter adds at most one base interval on top of base * 2^attempt.
        let d1 = backoff_delay(&retry, 1).as_secs();
        assert!((10..=15).contains(&d1), "attempt 1 delay was {d1}");

        let d3 = backoff_delay(&retry, 3).as_secs();
        assert!((40..=45).contains(&d3), "attempt 3 delay was {d3}");

        // Large attempts hit the cap instead of overflowing.
        assert_eq!(backoff_delay(&retry, 12).as_secs(), 300);
    }
}

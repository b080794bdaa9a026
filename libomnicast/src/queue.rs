//! Durable delayed job queue backed by SQLite
//!
//! Jobs are keyed by a caller-supplied idempotency key: enqueuing a key that is
//! already present is a no-op. Claiming is a single `UPDATE ... RETURNING`
//! statement, so a job is handed to at most one worker at a time even when
//! several worker pools share the database.
//!
//! Each claim carries a lease token. The worker holding it renews the lease
//! with [`JobQueue::touch`] while the job runs, and every settling call
//! (`complete`, `fail`, `retry_later`, `reschedule`) only applies while the
//! token still matches. A job whose lease ran out is handed to another worker
//! by [`JobQueue::recover_stalled`]; the old worker's late settle is ignored.
//!
//! Completed jobs are removed. Failed jobs stay in the table for inspection.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::{DbError, Result};

/// Named queue within the jobs table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    /// One job per task, runs the publish attempt
    Publish,
    /// Media processing polls
    Media,
    /// Edits of published posts
    Update,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Publish => "publish",
            QueueName::Media => "media",
            QueueName::Update => "update",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "failed" => Ok(JobState::Failed),
            other => Err(DbError::Corrupt(format!("unknown job state '{}'", other)).into()),
        }
    }
}

/// Delay between attempts after a retryable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `delay * 2^(attempt - 1)`
    Exponential(Duration),
    Fixed(Duration),
}

impl Backoff {
    /// Delay before the next run, given the number of attempts made so far
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match *self {
            Backoff::Exponential(base) => {
                let exponent = attempts.saturating_sub(1).min(20);
                base.saturating_mul(2u32.pow(exponent))
            }
            Backoff::Fixed(delay) => delay,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Backoff::Exponential(_) => "exponential",
            Backoff::Fixed(_) => "fixed",
        }
    }

    fn base(&self) -> Duration {
        match *self {
            Backoff::Exponential(d) | Backoff::Fixed(d) => d,
        }
    }

    fn from_columns(kind: &str, delay_ms: i64) -> Result<Self> {
        let delay = Duration::from_millis(delay_ms.max(0) as u64);
        match kind {
            "exponential" => Ok(Backoff::Exponential(delay)),
            "fixed" => Ok(Backoff::Fixed(delay)),
            other => Err(DbError::Corrupt(format!("unknown backoff '{}'", other)).into()),
        }
    }
}

/// Retry budget attached to each job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

/// Everything needed to enqueue a job
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub task_id: String,
    pub policy: RetryPolicy,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: QueueName,
    pub task_id: String,
    pub state: JobState,
    /// Attempts started so far, including the current one while active
    pub attempts: u32,
    pub policy: RetryPolicy,
    pub run_at_ms: i64,
    /// Times the job rescheduled itself (media status polls)
    pub polls: u32,
    pub last_error: Option<String>,
    /// Lease token of the claim that produced this value
    pub lock_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    /// A job with the same key already exists in this state
    AlreadyQueued(JobState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
    /// The job is being processed and cannot be removed
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled(Duration),
    Exhausted,
    /// The job was reclaimed by another worker; nothing was changed
    LeaseLost,
}

/// Job counts for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub failed: i64,
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    name: QueueName,
}

const JOB_COLUMNS: &str = "id, queue, task_id, state, attempts, max_attempts, backoff, backoff_delay_ms, \
     run_at_ms, polls, last_error, lock_token";

impl JobQueue {
    pub fn new(db: Database, name: QueueName) -> Self {
        Self { db, name }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    /// Add a job unless one with the same key already exists
    pub async fn enqueue(&self, spec: &JobSpec) -> Result<EnqueueOutcome> {
        let now = now_ms();
        let delay_ms = duration_ms(spec.delay);
        let state = if delay_ms > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        let result = sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, queue, task_id, state, attempts, max_attempts, backoff,
                backoff_delay_ms, run_at_ms, polls, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&spec.id)
        .bind(self.name.as_str())
        .bind(&spec.task_id)
        .bind(state.as_str())
        .bind(spec.policy.max_attempts as i64)
        .bind(spec.policy.backoff.kind())
        .bind(duration_ms(spec.policy.backoff.base()))
        .bind(now + delay_ms)
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() > 0 {
            debug!(queue = %self.name, job_id = %spec.id, delay_ms, "Job enqueued");
            return Ok(EnqueueOutcome::Added);
        }

        let existing = self.get(&spec.id).await?;
        let state = existing.map(|j| j.state).unwrap_or(JobState::Waiting);
        debug!(queue = %self.name, job_id = %spec.id, state = state.as_str(), "Job already queued");
        Ok(EnqueueOutcome::AlreadyQueued(state))
    }

    /// Atomically take the next due job and mark it active under a fresh lease
    pub async fn claim(&self) -> Result<Option<Job>> {
        let now = now_ms();
        let token = uuid::Uuid::new_v4().to_string();

        let row = sqlx::query(&format!(
            r#"
            UPDATE queue_jobs
            SET state = 'active', attempts = attempts + 1, locked_at_ms = ?, lock_token = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM queue_jobs
                WHERE queue = ? AND state IN ('waiting', 'delayed') AND run_at_ms <= ?
                ORDER BY run_at_ms ASC, created_at ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(&token)
        .bind(now)
        .bind(self.name.as_str())
        .bind(now)
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM queue_jobs WHERE id = ? AND queue = ?",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(self.name.as_str())
        .fetch_optional(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Extend the lease on a claimed job. Returns false once the job is no
    /// longer held under this claim.
    pub async fn touch(&self, job: &Job) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE queue_jobs SET locked_at_ms = ?, updated_at = ? \
             WHERE id = ? AND queue = ? AND state = 'active' AND lock_token = ?",
        )
        .bind(now)
        .bind(now)
        .bind(&job.id)
        .bind(self.name.as_str())
        .bind(&job.lock_token)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Finished successfully; the job is removed. Returns false if the lease was lost.
    pub async fn complete(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM queue_jobs WHERE id = ? AND queue = ? AND state = 'active' AND lock_token = ?",
        )
        .bind(&job.id)
        .bind(self.name.as_str())
        .bind(&job.lock_token)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(self.settled(job, result.rows_affected()))
    }

    /// Terminal failure, no further attempts. Returns false if the lease was lost.
    pub async fn fail(&self, job: &Job, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET state = 'failed', last_error = ?, locked_at_ms = NULL, lock_token = NULL, \
             updated_at = ? WHERE id = ? AND queue = ? AND state = 'active' AND lock_token = ?",
        )
        .bind(error)
        .bind(now_ms())
        .bind(&job.id)
        .bind(self.name.as_str())
        .bind(&job.lock_token)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(self.settled(job, result.rows_affected()))
    }

    fn settled(&self, job: &Job, rows: u64) -> bool {
        if rows == 0 {
            warn!(queue = %self.name, job_id = %job.id, "Lease lost, job was reclaimed by another worker");
        }
        rows > 0
    }

    /// Schedule another attempt after a retryable failure, or mark the job
    /// failed once its attempts are used up
    pub async fn retry_later(&self, job: &Job, error: &str) -> Result<RetryDecision> {
        if job.attempts >= job.policy.max_attempts {
            return Ok(match self.fail(job, error).await? {
                true => RetryDecision::Exhausted,
                false => RetryDecision::LeaseLost,
            });
        }

        let delay = job.policy.backoff.delay_for(job.attempts);
        Ok(match self.set_delayed(job, delay, Some(error), false).await? {
            true => RetryDecision::Scheduled(delay),
            false => RetryDecision::LeaseLost,
        })
    }

    /// Run the same job again after `delay` without spending an attempt.
    /// Returns false if the lease was lost.
    pub async fn reschedule(&self, job: &Job, delay: Duration) -> Result<bool> {
        self.set_delayed(job, delay, None, true).await
    }

    async fn set_delayed(&self, job: &Job, delay: Duration, error: Option<&str>, poll: bool) -> Result<bool> {
        let now = now_ms();
        let sql = if poll {
            "UPDATE queue_jobs SET state = 'delayed', run_at_ms = ?, attempts = 0, polls = polls + 1, \
             last_error = COALESCE(?, last_error), locked_at_ms = NULL, lock_token = NULL, updated_at = ? \
             WHERE id = ? AND queue = ? AND state = 'active' AND lock_token = ?"
        } else {
            "UPDATE queue_jobs SET state = 'delayed', run_at_ms = ?, \
             last_error = COALESCE(?, last_error), locked_at_ms = NULL, lock_token = NULL, updated_at = ? \
             WHERE id = ? AND queue = ? AND state = 'active' AND lock_token = ?"
        };

        let result = sqlx::query(sql)
            .bind(now + duration_ms(delay))
            .bind(error)
            .bind(now)
            .bind(&job.id)
            .bind(self.name.as_str())
            .bind(&job.lock_token)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(self.settled(job, result.rows_affected()))
    }

    /// Remove a job that has not started yet
    pub async fn remove(&self, job_id: &str) -> Result<RemoveOutcome> {
        let result = sqlx::query(
            "DELETE FROM queue_jobs WHERE id = ? AND queue = ? AND state IN ('waiting', 'delayed', 'failed')",
        )
        .bind(job_id)
        .bind(self.name.as_str())
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() > 0 {
            return Ok(RemoveOutcome::Removed);
        }

        match self.get(job_id).await? {
            Some(job) if job.state == JobState::Active => Ok(RemoveOutcome::Active),
            Some(_) | None => Ok(RemoveOutcome::NotFound),
        }
    }

    /// Make a pending job due now. Returns false if no pending job exists.
    pub async fn promote(&self, job_id: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE queue_jobs SET state = 'waiting', run_at_ms = ?, updated_at = ? \
             WHERE id = ? AND queue = ? AND state IN ('waiting', 'delayed')",
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .bind(self.name.as_str())
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Return jobs whose worker disappeared to the waiting state
    ///
    /// A job stays `active` if its worker process dies mid-attempt. Once the
    /// lease has gone `older_than` without a heartbeat the job is handed out
    /// again; the attempt it was on still counts.
    pub async fn recover_stalled(&self, older_than: Duration) -> Result<u64> {
        let now = now_ms();
        let cutoff = now - duration_ms(older_than);

        let result = sqlx::query(
            "UPDATE queue_jobs SET state = 'waiting', run_at_ms = ?, locked_at_ms = NULL, lock_token = NULL, \
             updated_at = ? WHERE queue = ? AND state = 'active' AND locked_at_ms <= ?",
        )
        .bind(now)
        .bind(now)
        .bind(self.name.as_str())
        .bind(cutoff)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            warn!(queue = %self.name, recovered, "Recovered stalled jobs");
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let now = now_ms();
        let rows = sqlx::query(
            r#"
            SELECT
                CASE WHEN state IN ('waiting', 'delayed') AND run_at_ms > ? THEN 'delayed'
                     WHEN state = 'delayed' THEN 'waiting'
                     ELSE state END AS bucket,
                COUNT(*) AS count
            FROM queue_jobs WHERE queue = ?
            GROUP BY bucket
            "#,
        )
        .bind(now)
        .bind(self.name.as_str())
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let mut stats = QueueStats::default();
        for row in rows {
            let bucket: String = row.get("bucket");
            let count: i64 = row.get("count");
            match bucket.as_str() {
                "waiting" => stats.waiting += count,
                "delayed" => stats.delayed += count,
                "active" => stats.active += count,
                "failed" => stats.failed += count,
                _ => {}
            }
        }
        Ok(stats)
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn job_from_row(r: &SqliteRow) -> Result<Job> {
    let queue: String = r.get("queue");
    let state: String = r.get("state");
    let backoff: String = r.get("backoff");

    Ok(Job {
        id: r.get("id"),
        queue: match queue.as_str() {
            "publish" => QueueName::Publish,
            "media" => QueueName::Media,
            "update" => QueueName::Update,
            other => return Err(DbError::Corrupt(format!("unknown queue '{}'", other)).into()),
        },
        task_id: r.get("task_id"),
        state: JobState::parse(&state)?,
        attempts: r.get::<i64, _>("attempts").max(0) as u32,
        policy: RetryPolicy {
            max_attempts: r.get::<i64, _>("max_attempts").max(0) as u32,
            backoff: Backoff::from_columns(&backoff, r.get("backoff_delay_ms"))?,
        },
        run_at_ms: r.get("run_at_ms"),
        polls: r.get::<i64, _>("polls").max(0) as u32,
        last_error: r.get("last_error"),
        lock_token: r.get("lock_token"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, max_attempts: u32, backoff: Backoff) -> JobSpec {
        JobSpec {
            id: id.to_string(),
            task_id: format!("task-{}", id),
            policy: RetryPolicy {
                max_attempts,
                backoff,
            },
            delay: Duration::ZERO,
        }
    }

    async fn publish_queue() -> JobQueue {
        let db = Database::in_memory().await.unwrap();
        JobQueue::new(db, QueueName::Publish)
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let backoff = Backoff::Exponential(Duration::from_secs(5));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(20));
        assert_eq!(
            Backoff::Fixed(Duration::from_secs(15)).delay_for(4),
            Duration::from_secs(15)
        );
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_on_key() {
        let queue = publish_queue().await;
        let job = spec("publish:tiktok:1", 3, Backoff::Exponential(Duration::ZERO));

        assert_eq!(queue.enqueue(&job).await.unwrap(), EnqueueOutcome::Added);
        assert_eq!(
            queue.enqueue(&job).await.unwrap(),
            EnqueueOutcome::AlreadyQueued(JobState::Waiting)
        );

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn test_claim_hands_out_job_once() {
        let queue = publish_queue().await;
        queue
            .enqueue(&spec("a", 3, Backoff::Exponential(Duration::ZERO)))
            .await
            .unwrap();

        let claimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, "a");
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.state, JobState::Active);

        assert!(queue.claim().await.unwrap().is_none());
        assert_eq!(
            queue
                .enqueue(&spec("a", 3, Backoff::Exponential(Duration::ZERO)))
                .await
                .unwrap(),
            EnqueueOutcome::AlreadyQueued(JobState::Active)
        );
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimed_early() {
        let queue = publish_queue().await;
        let mut job = spec("later", 3, Backoff::Exponential(Duration::ZERO));
        job.delay = Duration::from_secs(3600);
        queue.enqueue(&job).await.unwrap();

        assert!(queue.claim().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().delayed, 1);

        assert!(queue.promote("later").await.unwrap());
        assert!(queue.claim().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retry_until_exhausted() {
        let queue = publish_queue().await;
        queue
            .enqueue(&spec("r", 2, Backoff::Exponential(Duration::ZERO)))
            .await
            .unwrap();

        let first = queue.claim().await.unwrap().unwrap();
        assert_eq!(
            queue.retry_later(&first, "boom").await.unwrap(),
            RetryDecision::Scheduled(Duration::ZERO)
        );

        let second = queue.claim().await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.last_error.as_deref(), Some("boom"));
        assert_eq!(
            queue.retry_later(&second, "boom again").await.unwrap(),
            RetryDecision::Exhausted
        );

        assert!(queue.claim().await.unwrap().is_none());
        let failed = queue.get("r").await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn test_reschedule_counts_polls_and_resets_attempts() {
        let queue = publish_queue().await;
        queue
            .enqueue(&spec("poll", 5, Backoff::Fixed(Duration::ZERO)))
            .await
            .unwrap();

        let job = queue.claim().await.unwrap().unwrap();
        assert!(queue.reschedule(&job, Duration::ZERO).await.unwrap());

        let again = queue.claim().await.unwrap().unwrap();
        assert_eq!(again.polls, 1);
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_remove_refuses_active_job() {
        let queue = publish_queue().await;
        queue
            .enqueue(&spec("x", 3, Backoff::Exponential(Duration::ZERO)))
            .await
            .unwrap();
        queue
            .enqueue(&spec("y", 3, Backoff::Exponential(Duration::ZERO)))
            .await
            .unwrap();

        let active = queue.claim().await.unwrap().unwrap();
        assert_eq!(queue.remove(&active.id).await.unwrap(), RemoveOutcome::Active);

        let other = if active.id == "x" { "y" } else { "x" };
        assert_eq!(queue.remove(other).await.unwrap(), RemoveOutcome::Removed);
        assert_eq!(queue.remove("missing").await.unwrap(), RemoveOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_complete_removes_job() {
        let queue = publish_queue().await;
        queue
            .enqueue(&spec("done", 3, Backoff::Exponential(Duration::ZERO)))
            .await
            .unwrap();
        let job = queue.claim().await.unwrap().unwrap();
        assert!(queue.complete(&job).await.unwrap());
        assert!(queue.get("done").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_stalled_returns_job_to_queue() {
        let queue = publish_queue().await;
        queue
            .enqueue(&spec("stuck", 3, Backoff::Exponential(Duration::ZERO)))
            .await
            .unwrap();
        queue.claim().await.unwrap().unwrap();

        assert_eq!(queue.recover_stalled(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.recover_stalled(Duration::ZERO).await.unwrap(), 1);

        let reclaimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_reclaimed_job_rejects_stale_settle() {
        let queue = publish_queue().await;
        queue
            .enqueue(&spec("long", 3, Backoff::Exponential(Duration::ZERO)))
            .await
            .unwrap();

        let stale = queue.claim().await.unwrap().unwrap();
        assert!(queue.touch(&stale).await.unwrap());
        assert_eq!(queue.recover_stalled(Duration::ZERO).await.unwrap(), 1);
        let current = queue.claim().await.unwrap().unwrap();
        assert_ne!(stale.lock_token, current.lock_token);

        // The first worker finishes late; none of its settles apply
        assert!(!queue.touch(&stale).await.unwrap());
        assert!(!queue.complete(&stale).await.unwrap());
        assert!(!queue.fail(&stale, "late").await.unwrap());
        assert!(!queue.reschedule(&stale, Duration::ZERO).await.unwrap());
        assert_eq!(
            queue.retry_later(&stale, "late").await.unwrap(),
            RetryDecision::LeaseLost
        );

        let job = queue.get("long").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.lock_token, current.lock_token);
        assert_eq!(job.last_error, None);

        assert!(queue.complete(&current).await.unwrap());
        assert!(queue.get("long").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_job_from_being_recovered() {
        let queue = publish_queue().await;
        queue
            .enqueue(&spec("busy", 3, Backoff::Exponential(Duration::ZERO)))
            .await
            .unwrap();
        let job = queue.claim().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(queue.touch(&job).await.unwrap());

        assert_eq!(queue.recover_stalled(Duration::from_millis(50)).await.unwrap(), 0);
        assert_eq!(queue.get("busy").await.unwrap().unwrap().state, JobState::Active);
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let db = Database::in_memory().await.unwrap();
        let publish = JobQueue::new(db.clone(), QueueName::Publish);
        let media = JobQueue::new(db, QueueName::Media);

        publish
            .enqueue(&spec("p", 3, Backoff::Exponential(Duration::ZERO)))
            .await
            .unwrap();
        assert!(media.claim().await.unwrap().is_none());
        assert!(publish.claim().await.unwrap().is_some());
    }
}

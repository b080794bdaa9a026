//! Worker pool that drains a [`JobQueue`] with bounded concurrency
//!
//! While a handler runs, its job's lease is renewed every `heartbeat` so a
//! long attempt (a multi-gigabyte segmented transfer) is not mistaken for a
//! crashed one and handed to a second worker.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::queue::{Job, JobQueue, QueueName, RetryDecision};

/// What the worker should do with a job after the handler ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDisposition {
    /// Done; remove the job
    Complete,
    /// Retryable failure; spend an attempt and back off
    Retry(String),
    /// Terminal failure; the handler has already recorded it on the task
    Fail(String),
    /// Run again after the delay without spending an attempt
    Reschedule(Duration),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn queue(&self) -> QueueName;

    /// Process one claimed job. An `Err` is treated as a retryable failure.
    async fn handle(&self, job: &Job) -> Result<JobDisposition>;

    /// Called once when a job has used its last attempt
    async fn on_exhausted(&self, job: &Job, error: &str) -> Result<()>;
}

/// Lease renewal interval used unless the pool is configured otherwise
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

pub struct WorkerPool {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    concurrency: usize,
    poll_interval: Duration,
    heartbeat: Duration,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>, concurrency: usize, poll_interval: Duration) -> Self {
        Self {
            queue,
            handler,
            concurrency: concurrency.max(1),
            poll_interval,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    /// Renew the lease of running jobs this often
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat.max(Duration::from_millis(1));
        self
    }

    /// Claim and process jobs until `shutdown` is set
    ///
    /// Jobs already running when shutdown is requested are allowed to finish.
    pub async fn run(self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let queue_name = self.queue.name();
        info!(queue = %queue_name, concurrency = self.concurrency, "Worker pool started");

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut running = JoinSet::new();

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!(queue = %queue_name, "Shutdown requested, stopping worker pool");
                break;
            }

            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!(queue = %queue_name, error = %e, "Job task panicked");
                }
            }

            let permit = match permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            match self.queue.claim().await {
                Ok(Some(job)) => {
                    let queue = self.queue.clone();
                    let handler = self.handler.clone();
                    let heartbeat = self.heartbeat;
                    running.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = process_job(&queue, handler.as_ref(), job, heartbeat).await {
                            error!(queue = %queue.name(), error = %e, "Failed to settle job");
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = %queue_name, error = %e, "Failed to claim job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(queue = %queue_name, error = %e, "Job task panicked");
            }
        }

        info!(queue = %queue_name, "Worker pool stopped");
        Ok(())
    }

    /// Process every job that is due right now, one at a time, and return how
    /// many were processed. Jobs rescheduled with a zero delay are picked up
    /// again within the same call.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(job) = self.queue.claim().await? {
            process_job(&self.queue, self.handler.as_ref(), job, self.heartbeat).await?;
            processed += 1;
        }
        Ok(processed)
    }
}

/// Run the handler for one claimed job and settle it in the queue
///
/// The job's lease is renewed every `heartbeat` until the handler returns. If
/// the job was reclaimed in the meantime the settle is skipped; the worker
/// now holding it decides the outcome.
pub async fn process_job(
    queue: &JobQueue,
    handler: &dyn JobHandler,
    job: Job,
    heartbeat: Duration,
) -> Result<JobDisposition> {
    debug!(queue = %queue.name(), job_id = %job.id, attempt = job.attempts, "Processing job");

    let outcome = {
        let work = handler.handle(&job);
        tokio::pin!(work);
        let mut beat = interval_at(Instant::now() + heartbeat, heartbeat);
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                _ = beat.tick() => match queue.touch(&job).await {
                    Ok(true) => debug!(job_id = %job.id, "Lease renewed"),
                    Ok(false) => warn!(job_id = %job.id, "Lease lost while the job was running"),
                    Err(e) => warn!(job_id = %job.id, error = %e, "Failed to renew lease"),
                },
            }
        }
    };

    let disposition = match outcome {
        Ok(disposition) => disposition,
        Err(e) => {
            warn!(job_id = %job.id, attempt = job.attempts, error = %e, "Job attempt errored");
            JobDisposition::Retry(e.to_string())
        }
    };

    match &disposition {
        JobDisposition::Complete => {
            queue.complete(&job).await?;
        }
        JobDisposition::Fail(message) => {
            queue.fail(&job, message).await?;
        }
        JobDisposition::Reschedule(delay) => {
            queue.reschedule(&job, *delay).await?;
        }
        JobDisposition::Retry(message) => match queue.retry_later(&job, message).await? {
            RetryDecision::Scheduled(delay) => {
                info!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = job.policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Job will be retried"
                );
            }
            RetryDecision::Exhausted => {
                warn!(job_id = %job.id, attempts = job.attempts, "Job exhausted its attempts");
                handler.on_exhausted(&job, message).await?;
            }
            RetryDecision::LeaseLost => {}
        },
    }

    Ok(disposition)
}

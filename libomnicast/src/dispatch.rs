//! Publish dispatch
//!
//! [`DispatchQueue`] puts each task on the publish queue under its
//! `queue_job_id`, delayed until the task's scheduled time. Workers run
//! [`PublishJobHandler`], which performs one publish attempt per job run and
//! routes the outcome:
//!
//! | outcome                 | task          | job                      |
//! |-------------------------|---------------|--------------------------|
//! | published               | record, gone  | complete                 |
//! | processing              | PUB_LOADING   | complete, media job added |
//! | submitted               | PUBLISHING    | complete, webhook pending |
//! | failed, no retry        | FAIL          | failed                   |
//! | failed, retryable       | PUBLISHING    | retried with backoff     |
//!
//! A task is marked FAIL exactly once: either for a no-retry outcome or when
//! the job runs out of attempts.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::completion::CompletionHandler;
use crate::config::QueueConfig;
use crate::credentials::AuthStatus;
use crate::db::Database;
use crate::error::{PlatformError, Result};
use crate::pipeline::MediaPipeline;
use crate::publishers::{PubOutcome, Publisher, PublisherRegistry};
use crate::queue::{now_ms, Backoff, EnqueueOutcome, Job, JobQueue, JobSpec, QueueName, RemoveOutcome, RetryPolicy};
use crate::types::{PublishTask, TaskStatus};
use crate::worker::{JobDisposition, JobHandler};

/// The publish queue, addressed by task
#[derive(Clone)]
pub struct DispatchQueue {
    queue: JobQueue,
    policy: RetryPolicy,
}

impl DispatchQueue {
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        Self {
            queue: JobQueue::new(db, QueueName::Publish),
            policy: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                backoff: Backoff::Exponential(config.backoff_base()),
            },
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Enqueue the task to run at its scheduled time, or now if that has passed
    ///
    /// Enqueuing the same task twice is a no-op.
    pub async fn enqueue(&self, task: &PublishTask) -> Result<EnqueueOutcome> {
        let delay_ms = (task.scheduled_at.saturating_mul(1000) - now_ms()).max(0);
        self.submit(task, Duration::from_millis(delay_ms as u64)).await
    }

    /// Enqueue the task to run as soon as a worker is free
    pub async fn enqueue_now(&self, task: &PublishTask) -> Result<EnqueueOutcome> {
        self.submit(task, Duration::ZERO).await
    }

    async fn submit(&self, task: &PublishTask, delay: Duration) -> Result<EnqueueOutcome> {
        let spec = JobSpec {
            id: task.queue_job_id.clone(),
            task_id: task.id.clone(),
            policy: self.policy,
            delay,
        };

        let outcome = self.queue.enqueue(&spec).await?;
        if outcome == EnqueueOutcome::Added {
            info!(
                task_id = %task.id,
                job_id = %spec.id,
                delay_ms = delay.as_millis() as u64,
                "Task queued for publishing"
            );
        }
        Ok(outcome)
    }

    pub async fn remove(&self, task: &PublishTask) -> Result<RemoveOutcome> {
        self.queue.remove(&task.queue_job_id).await
    }

    /// Make a delayed job due now. Returns false when no pending job exists.
    pub async fn promote(&self, task: &PublishTask) -> Result<bool> {
        self.queue.promote(&task.queue_job_id).await
    }

    pub async fn job(&self, task: &PublishTask) -> Result<Option<Job>> {
        self.queue.get(&task.queue_job_id).await
    }
}

/// Publish queue handler
pub struct PublishJobHandler {
    db: Database,
    publishers: PublisherRegistry,
    completion: CompletionHandler,
    pipeline: MediaPipeline,
}

impl PublishJobHandler {
    pub fn new(db: Database, publishers: PublisherRegistry, completion: CompletionHandler, pipeline: MediaPipeline) -> Self {
        Self {
            db,
            publishers,
            completion,
            pipeline,
        }
    }

    async fn fail(&self, task: &PublishTask, message: &str) -> Result<JobDisposition> {
        self.completion.fail(task, message).await?;
        Ok(JobDisposition::Fail(message.to_string()))
    }

    /// Settle an outcome of `do_pub`
    async fn route(&self, task: &PublishTask, outcome: PubOutcome) -> Result<JobDisposition> {
        match outcome {
            PubOutcome::Published(content) => {
                self.db.set_destination_content_id(&task.id, &content.content_id).await?;
                self.completion.complete(task, &content).await?;
                Ok(JobDisposition::Complete)
            }
            PubOutcome::Processing => {
                self.db.update_task_status(&task.id, TaskStatus::PubLoading).await?;
                self.pipeline.ensure_polling(task).await?;
                debug!(task_id = %task.id, "Task handed to media pipeline");
                Ok(JobDisposition::Complete)
            }
            PubOutcome::Submitted(content) => {
                self.completion.record_submitted(task, &content).await?;
                Ok(JobDisposition::Complete)
            }
            PubOutcome::Failed { message, no_retry: true } => self.fail(task, &message).await,
            PubOutcome::Failed { message, .. } => {
                self.db.set_task_error(&task.id, &message).await?;
                Ok(JobDisposition::Retry(message))
            }
        }
    }
}

/// Look for a post left behind by an attempt whose result was lost
///
/// A found post completes the task. `None` means nothing was found and the
/// caller should go ahead and publish. A transient lookup failure asks for a
/// retry instead, so a post is never created while its predecessor might exist.
pub(crate) async fn recover_earlier_post(
    completion: &CompletionHandler,
    publisher: &dyn Publisher,
    task: &PublishTask,
) -> Result<Option<JobDisposition>> {
    match publisher.find_existing(task).await {
        Ok(Some(content)) => {
            info!(task_id = %task.id, content_id = %content.content_id, "Found post from an earlier attempt");
            completion.complete(task, &content).await?;
            Ok(Some(JobDisposition::Complete))
        }
        Ok(None) => Ok(None),
        Err(e) => match PubOutcome::from_error(e)? {
            PubOutcome::Failed { message, no_retry: false } => Ok(Some(JobDisposition::Retry(message))),
            other => {
                warn!(task_id = %task.id, outcome = ?other, "Could not check for an earlier post");
                Ok(None)
            }
        },
    }
}

#[async_trait]
impl JobHandler for PublishJobHandler {
    fn queue(&self) -> QueueName {
        QueueName::Publish
    }

    async fn handle(&self, job: &Job) -> Result<JobDisposition> {
        let task = match self.db.get_task(&job.task_id).await? {
            Some(task) if !task.status.is_terminal() => task,
            _ => {
                debug!(job_id = %job.id, task_id = %job.task_id, "Task gone or finished, dropping job");
                return Ok(JobDisposition::Complete);
            }
        };

        if task.status == TaskStatus::PubLoading {
            // Already handed off; make sure the media job survived
            self.pipeline.ensure_polling(&task).await?;
            return Ok(JobDisposition::Complete);
        }

        let publisher = match self.publishers.get(task.destination) {
            Some(publisher) => publisher,
            None => {
                let message = format!("no publisher registered for {}", task.destination);
                return self.fail(&task, &message).await;
            }
        };

        let auth = publisher.check_auth(&task.account_id).await?;
        if auth.status == AuthStatus::Expired {
            let message = PlatformError::AuthExpired {
                destination: task.destination.to_string(),
                account_id: task.account_id.clone(),
            }
            .to_string();
            return self.fail(&task, &message).await;
        }

        // A previous attempt may have posted before failing or crashing
        if job.attempts > 1 || task.status == TaskStatus::Publishing {
            if let Some(disposition) = recover_earlier_post(&self.completion, publisher.as_ref(), &task).await? {
                return Ok(disposition);
            }
        }

        self.db.update_task_status(&task.id, TaskStatus::Publishing).await?;
        info!(
            task_id = %task.id,
            destination = %task.destination,
            attempt = job.attempts,
            "Publishing task"
        );

        let outcome = publisher.do_pub(&task).await?;
        self.route(&task, outcome).await
    }

    async fn on_exhausted(&self, job: &Job, error: &str) -> Result<()> {
        if let Some(task) = self.db.get_task(&job.task_id).await? {
            self.completion.fail(&task, error).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::ops;
    use crate::events::{Event, EventBus, EventReceiver};
    use crate::publishers::test_support::{harness, images, stored_task, video, Harness};
    use crate::publishers::{instagram, tiktok, twitter};
    use crate::queue::JobState;
    use crate::types::{ContentRefs, Destination, PublishedContent, RecordStatus};
    use crate::config::MediaConfig;
    use crate::worker::WorkerPool;
    use std::sync::Arc;

    struct Fixture {
        harness: Harness,
        dispatch: DispatchQueue,
        pipeline: MediaPipeline,
        workers: WorkerPool,
        events: EventReceiver,
    }

    async fn fixture(destination: Destination) -> Fixture {
        let harness = harness(destination).await;
        let db = harness.ctx.db.clone();
        let api = Arc::new(harness.api.clone());
        let publisher: Arc<dyn Publisher> = match destination {
            Destination::Tiktok => Arc::new(tiktok::TiktokPublisher::new(harness.ctx.clone(), api)),
            Destination::Instagram => Arc::new(instagram::InstagramPublisher::new(harness.ctx.clone(), api)),
            _ => Arc::new(twitter::TwitterPublisher::new(harness.ctx.clone(), api)),
        };
        let mut publishers = PublisherRegistry::new();
        publishers.register(publisher);

        let bus = EventBus::new(16);
        let events = bus.subscribe();
        let completion = CompletionHandler::new(db.clone(), bus);
        let dispatch = DispatchQueue::new(
            db.clone(),
            &QueueConfig {
                backoff_base_secs: 0,
                ..Default::default()
            },
        );
        let pipeline = MediaPipeline::new(db.clone(), &MediaConfig::default());
        let handler = PublishJobHandler::new(db, publishers, completion, pipeline.clone());
        let workers = WorkerPool::new(dispatch.queue().clone(), Arc::new(handler), 1, Duration::from_millis(10));

        Fixture {
            harness,
            dispatch,
            pipeline,
            workers,
            events,
        }
    }

    fn text(body: &str) -> ContentRefs {
        ContentRefs {
            description: Some(body.to_string()),
            ..Default::default()
        }
    }

    fn failures(receiver: &mut EventReceiver) -> usize {
        let mut count = 0;
        while let Ok(event) = receiver.try_recv() {
            if matches!(event, Event::TaskFailed { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn test_published_task_becomes_record() {
        let f = fixture(Destination::Twitter).await;
        let task = stored_task(&f.harness, Destination::Twitter, text("hello")).await;
        f.dispatch.enqueue(&task).await.unwrap();

        assert_eq!(f.workers.drain().await.unwrap(), 1);

        let db = &f.harness.ctx.db;
        assert!(db.get_task(&task.id).await.unwrap().is_none());
        let records = db.records_for_task(&task.id).await.unwrap();
        assert_eq!(records[0].destination_content_id, "post-1");
        assert!(f.dispatch.job(&task).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_and_delays_future_tasks() {
        let f = fixture(Destination::Twitter).await;
        let mut task = stored_task(&f.harness, Destination::Twitter, text("later")).await;
        task.scheduled_at = chrono::Utc::now().timestamp() + 3600;

        assert_eq!(f.dispatch.enqueue(&task).await.unwrap(), EnqueueOutcome::Added);
        assert_eq!(
            f.dispatch.enqueue(&task).await.unwrap(),
            EnqueueOutcome::AlreadyQueued(JobState::Delayed)
        );
        assert_eq!(f.workers.drain().await.unwrap(), 0);

        assert!(f.dispatch.promote(&task).await.unwrap());
        assert_eq!(f.workers.drain().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_retry_failure_fails_once() {
        let mut f = fixture(Destination::Twitter).await;
        let task = stored_task(&f.harness, Destination::Twitter, text(&"x".repeat(300))).await;
        f.dispatch.enqueue(&task).await.unwrap();

        assert_eq!(f.workers.drain().await.unwrap(), 1);

        let stored = f.harness.ctx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Fail);
        let job = f.dispatch.job(&task).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(failures(&mut f.events), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture(Destination::Twitter).await;
        f.harness
            .api
            .fail_next(ops::CREATE_POST, PlatformError::Network("reset".to_string()))
            .fail_next(ops::CREATE_POST, PlatformError::Network("reset".to_string()));
        let task = stored_task(&f.harness, Destination::Twitter, text("hello")).await;
        f.dispatch.enqueue(&task).await.unwrap();

        assert_eq!(f.workers.drain().await.unwrap(), 3);

        assert!(f.harness.ctx.db.get_task(&task.id).await.unwrap().is_none());
        assert_eq!(f.harness.api.calls(ops::CREATE_POST), 3);
        assert_eq!(f.harness.api.created_posts().len(), 1);
    }

    #[tokio::test]
    async fn test_attempt_cap_fails_task_once() {
        let mut f = fixture(Destination::Twitter).await;
        for _ in 0..3 {
            f.harness
                .api
                .fail_next(ops::CREATE_POST, PlatformError::Timeout("gateway".to_string()));
        }
        let task = stored_task(&f.harness, Destination::Twitter, text("hello")).await;
        f.dispatch.enqueue(&task).await.unwrap();

        assert_eq!(f.workers.drain().await.unwrap(), 3);

        let stored = f.harness.ctx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Fail);
        assert_eq!(stored.error_message.as_deref(), Some("Request timed out: gateway"));
        assert_eq!(failures(&mut f.events), 1);
    }

    #[tokio::test]
    async fn test_interrupted_attempt_finds_existing_post() {
        let f = fixture(Destination::Twitter).await;
        let task = stored_task(&f.harness, Destination::Twitter, text("hello")).await;
        f.harness
            .ctx
            .db
            .update_task_status(&task.id, TaskStatus::Publishing)
            .await
            .unwrap();
        f.harness.api.seed_post(&task.id, PublishedContent::new("1790"));
        f.dispatch.enqueue(&task).await.unwrap();

        f.workers.drain().await.unwrap();

        assert_eq!(f.harness.api.calls(ops::CREATE_POST), 0);
        let records = f.harness.ctx.db.records_for_task(&task.id).await.unwrap();
        assert_eq!(records[0].destination_content_id, "1790");
    }

    #[tokio::test]
    async fn test_lost_post_response_is_recovered_on_retry() {
        let f = fixture(Destination::Twitter).await;
        f.harness.api.lose_next_response(ops::CREATE_POST);
        let task = stored_task(&f.harness, Destination::Twitter, text("hello")).await;
        f.dispatch.enqueue(&task).await.unwrap();

        assert_eq!(f.workers.drain().await.unwrap(), 2);

        assert_eq!(f.harness.api.created_posts().len(), 1);
        let records = f.harness.ctx.db.records_for_task(&task.id).await.unwrap();
        assert_eq!(records[0].destination_content_id, "post-1");
    }

    #[tokio::test]
    async fn test_expired_authorization_is_not_retried() {
        let f = fixture(Destination::Twitter).await;
        f.harness
            .ctx
            .credentials
            .revoke("acc-1", Destination::Twitter)
            .await
            .unwrap();
        let task = stored_task(&f.harness, Destination::Twitter, text("hello")).await;
        f.dispatch.enqueue(&task).await.unwrap();

        assert_eq!(f.workers.drain().await.unwrap(), 1);

        let stored = f.harness.ctx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Fail);
        assert!(stored
            .error_message
            .unwrap_or_default()
            .starts_with("Authorization expired for twitter account acc-1"));
        assert_eq!(f.harness.api.calls(ops::CREATE_POST), 0);
    }

    #[tokio::test]
    async fn test_processing_hands_off_to_media_pipeline() {
        let f = fixture(Destination::Instagram).await;
        let task = stored_task(&f.harness, Destination::Instagram, images(&["https://cdn.example/a.jpg"])).await;
        f.dispatch.enqueue(&task).await.unwrap();

        f.workers.drain().await.unwrap();

        let stored = f.harness.ctx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::PubLoading);
        let media_job = f
            .pipeline
            .queue()
            .get(&MediaPipeline::job_id(&task))
            .await
            .unwrap();
        assert!(media_job.is_some());
        assert!(f.dispatch.job(&task).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submitted_task_waits_for_webhook() {
        let f = fixture(Destination::Tiktok).await;
        let task = stored_task(&f.harness, Destination::Tiktok, video("https://cdn.example/clip.mp4")).await;
        f.dispatch.enqueue(&task).await.unwrap();

        f.workers.drain().await.unwrap();

        let db = &f.harness.ctx.db;
        let stored = db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Publishing);
        let record = db
            .find_publish_record(Destination::Tiktok, "tiktok-session-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, RecordStatus::Publishing);
    }
}

//! Media Pipeline
//!
//! Destinations that process media asynchronously leave a task in
//! PUB_LOADING with one or more tracked containers. The pipeline owns one
//! job per such task on the media queue. Each run polls every unfinished
//! container, then either reschedules itself, fails the task, or finalizes
//! the publish once everything is ready.
//!
//! Rescheduling does not spend an attempt; only errors reaching the
//! destination do. `max_polls` bounds how long a task may stay in processing.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::completion::CompletionHandler;
use crate::config::MediaConfig;
use crate::db::Database;
use crate::dispatch::recover_earlier_post;
use crate::error::Result;
use crate::publishers::{PubOutcome, Publisher, PublisherRegistry};
use crate::queue::{Backoff, EnqueueOutcome, Job, JobQueue, JobSpec, JobState, QueueName, RemoveOutcome, RetryPolicy};
use crate::types::{ContainerStatus, MediaContainer, PublishTask, TaskStatus};
use crate::worker::{JobDisposition, JobHandler};

/// Enqueues and removes media polling jobs
#[derive(Clone)]
pub struct MediaPipeline {
    queue: JobQueue,
    poll_delay: Duration,
    policy: RetryPolicy,
}

impl MediaPipeline {
    pub fn new(db: Database, config: &MediaConfig) -> Self {
        Self {
            queue: JobQueue::new(db, QueueName::Media),
            poll_delay: Duration::from_secs(config.poll_delay_secs),
            policy: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                backoff: Backoff::Fixed(Duration::from_secs(config.retry_delay_secs)),
            },
        }
    }

    /// Override the delay before the first poll and between polls
    pub fn with_poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn poll_delay(&self) -> Duration {
        self.poll_delay
    }

    pub fn job_id(task: &PublishTask) -> String {
        format!("{}:media", task.queue_job_id)
    }

    /// Make sure exactly one polling job exists for the task
    ///
    /// A failed job left over from an earlier processing round is replaced.
    pub async fn ensure_polling(&self, task: &PublishTask) -> Result<EnqueueOutcome> {
        let spec = JobSpec {
            id: Self::job_id(task),
            task_id: task.id.clone(),
            policy: self.policy,
            delay: self.poll_delay,
        };

        match self.queue.enqueue(&spec).await? {
            EnqueueOutcome::AlreadyQueued(JobState::Failed) => {
                self.queue.remove(&spec.id).await?;
                let outcome = self.queue.enqueue(&spec).await?;
                debug!(task_id = %task.id, "Replaced failed media job");
                Ok(outcome)
            }
            outcome => Ok(outcome),
        }
    }

    pub async fn discard(&self, task: &PublishTask) -> Result<RemoveOutcome> {
        self.queue.remove(&Self::job_id(task)).await
    }
}

/// Media queue handler
pub struct MediaPollHandler {
    db: Database,
    publishers: PublisherRegistry,
    completion: CompletionHandler,
    poll_delay: Duration,
    max_polls: u32,
}

impl MediaPollHandler {
    pub fn new(
        db: Database,
        publishers: PublisherRegistry,
        completion: CompletionHandler,
        pipeline: &MediaPipeline,
        max_polls: u32,
    ) -> Self {
        Self {
            db,
            publishers,
            completion,
            poll_delay: pipeline.poll_delay(),
            max_polls: max_polls.max(1),
        }
    }

    async fn fail(&self, task: &PublishTask, message: &str) -> Result<JobDisposition> {
        self.completion.fail(task, message).await?;
        Ok(JobDisposition::Fail(message.to_string()))
    }

    /// Poll every unfinished container and persist status changes. The inner
    /// `Err` is a disposition that ends this run early.
    async fn poll(
        &self,
        publisher: &dyn Publisher,
        task: &PublishTask,
    ) -> Result<std::result::Result<Vec<MediaContainer>, JobDisposition>> {
        let mut containers = self.db.containers_for_task(&task.id).await?;
        for container in containers.iter_mut().filter(|c| !c.status.is_terminal()) {
            let status = match publisher.container_status(task, container).await {
                Ok(status) => status,
                Err(e) => {
                    return match PubOutcome::from_error(e)? {
                        PubOutcome::Failed { message, no_retry: true } => Ok(Err(self.fail(task, &message).await?)),
                        PubOutcome::Failed { message, .. } => Ok(Err(JobDisposition::Retry(message))),
                        _ => Ok(Err(JobDisposition::Retry("unexpected container status outcome".to_string()))),
                    };
                }
            };
            if status != container.status {
                self.db.update_container_status(&container.id, status).await?;
                container.status = status;
            }
        }
        Ok(Ok(containers))
    }
}

#[async_trait]
impl JobHandler for MediaPollHandler {
    fn queue(&self) -> QueueName {
        QueueName::Media
    }

    async fn handle(&self, job: &Job) -> Result<JobDisposition> {
        let task = match self.db.get_task(&job.task_id).await? {
            Some(task) if !task.status.is_terminal() => task,
            _ => {
                debug!(job_id = %job.id, task_id = %job.task_id, "Task gone or finished, dropping media job");
                return Ok(JobDisposition::Complete);
            }
        };

        let publisher = match self.publishers.get(task.destination) {
            Some(publisher) => publisher,
            None => {
                let message = format!("no publisher registered for {}", task.destination);
                return self.fail(&task, &message).await;
            }
        };

        let containers = match self.poll(publisher.as_ref(), &task).await? {
            Ok(containers) => containers,
            Err(disposition) => return Ok(disposition),
        };

        if containers.is_empty() {
            return self.fail(&task, "no media containers to poll").await;
        }

        if let Some(failed) = containers.iter().find(|c| c.status == ContainerStatus::Failed) {
            warn!(
                task_id = %task.id,
                container_id = %failed.destination_container_id,
                "Destination failed to process media"
            );
            return self.fail(&task, "media processing failed at destination").await;
        }

        if containers.iter().any(|c| c.status != ContainerStatus::Finished) {
            if job.polls + 1 >= self.max_polls {
                return self.fail(&task, "media processing timed out").await;
            }
            if task.status != TaskStatus::PubLoading {
                self.db.update_task_status(&task.id, TaskStatus::PubLoading).await?;
            }
            debug!(task_id = %task.id, polls = job.polls, "Media still processing");
            return Ok(JobDisposition::Reschedule(self.poll_delay));
        }

        // An earlier finalize may have published before its response was lost
        if job.attempts > 1 {
            if let Some(disposition) = recover_earlier_post(&self.completion, publisher.as_ref(), &task).await? {
                return Ok(disposition);
            }
        }

        info!(task_id = %task.id, containers = containers.len(), "Media processed, publishing");
        match publisher.finalize(&task, &containers).await? {
            PubOutcome::Published(content) => {
                self.db.set_destination_content_id(&task.id, &content.content_id).await?;
                self.completion.complete(&task, &content).await?;
                Ok(JobDisposition::Complete)
            }
            PubOutcome::Submitted(content) => {
                self.completion.record_submitted(&task, &content).await?;
                Ok(JobDisposition::Complete)
            }
            PubOutcome::Processing => Ok(JobDisposition::Reschedule(self.poll_delay)),
            PubOutcome::Failed { message, no_retry: true } => self.fail(&task, &message).await,
            PubOutcome::Failed { message, .. } => {
                self.db.set_task_error(&task.id, &message).await?;
                Ok(JobDisposition::Retry(message))
            }
        }
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
    use crate::error::PlatformError;
    use crate::events::EventBus;
    use crate::publishers::instagram::InstagramPublisher;
    use crate::publishers::test_support::{harness, images, stored_task, video, Harness};
    use crate::publishers::twitter::TwitterPublisher;
    use crate::types::{ContentRefs, Destination};
    use crate::worker::WorkerPool;
    use std::sync::Arc;

    struct Fixture {
        harness: Harness,
        pipeline: MediaPipeline,
        workers: WorkerPool,
        publisher: Arc<dyn Publisher>,
    }

    async fn fixture(max_polls: u32) -> Fixture {
        fixture_for(Destination::Instagram, max_polls).await
    }

    async fn fixture_for(destination: Destination, max_polls: u32) -> Fixture {
        let harness = harness(destination).await;
        let db = harness.ctx.db.clone();
        let api = Arc::new(harness.api.clone());
        let publisher: Arc<dyn Publisher> = match destination {
            Destination::Twitter => Arc::new(TwitterPublisher::new(harness.ctx.clone(), api)),
            _ => Arc::new(InstagramPublisher::new(harness.ctx.clone(), api)),
        };
        let mut publishers = PublisherRegistry::new();
        publishers.register(publisher.clone());

        let config = MediaConfig {
            retry_delay_secs: 0,
            ..Default::default()
        };
        let pipeline = MediaPipeline::new(db.clone(), &config).with_poll_delay(Duration::ZERO);
        let completion = CompletionHandler::new(db.clone(), EventBus::default());
        let handler = MediaPollHandler::new(db, publishers, completion, &pipeline, max_polls);
        let workers = WorkerPool::new(
            pipeline.queue().clone(),
            Arc::new(handler),
            1,
            Duration::from_millis(10),
        );

        Fixture {
            harness,
            pipeline,
            workers,
            publisher,
        }
    }

    async fn start(f: &Fixture, urls: &[&str]) -> PublishTask {
        start_with(f, images(urls)).await
    }

    async fn start_with(f: &Fixture, content: ContentRefs) -> PublishTask {
        let task = stored_task(&f.harness, f.publisher.destination(), content).await;
        assert_eq!(f.publisher.do_pub(&task).await.unwrap(), PubOutcome::Processing);
        f.pipeline.ensure_polling(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_polls_until_all_containers_finish() {
        let f = fixture(10).await;
        f.harness.api.script_status("container-1", &["IN_PROGRESS", "FINISHED"]);
        f.harness
            .api
            .script_status("container-2", &["IN_PROGRESS", "IN_PROGRESS", "FINISHED"]);
        let task = start(&f, &["https://cdn.example/a.jpg", "https://cdn.example/b.jpg"]).await;

        let runs = f.workers.drain().await.unwrap();

        assert_eq!(runs, 3);
        let db = &f.harness.ctx.db;
        assert!(db.get_task(&task.id).await.unwrap().is_none());
        let records = db.records_for_task(&task.id).await.unwrap();
        assert_eq!(records[0].destination_content_id, "media-container-3");
        // container-1 is not polled again once finished
        assert_eq!(f.harness.api.calls(ops::CONTAINER_STATUS), 5);
    }

    #[tokio::test]
    async fn test_failed_container_fails_task() {
        let f = fixture(10).await;
        f.harness.api.script_status("container-1", &["ERROR"]);
        let task = start(&f, &["https://cdn.example/a.jpg"]).await;

        f.workers.drain().await.unwrap();

        let stored = f.harness.ctx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Fail);
        assert_eq!(f.harness.api.calls(ops::PUBLISH_CONTAINER), 0);
        let job = f.pipeline.queue().get(&MediaPipeline::job_id(&task)).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_processing_times_out() {
        let f = fixture(3).await;
        f.harness.api.set_default_status("IN_PROGRESS");
        let task = start(&f, &["https://cdn.example/a.jpg"]).await;

        assert_eq!(f.workers.drain().await.unwrap(), 3);

        let stored = f.harness.ctx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Fail);
        assert_eq!(stored.error_message.as_deref(), Some("media processing timed out"));
    }

    #[tokio::test]
    async fn test_task_waits_in_pub_loading() {
        let f = fixture(10).await;
        f.harness.api.script_status("container-1", &["IN_PROGRESS", "FINISHED"]);
        let task = start(&f, &["https://cdn.example/a.jpg"]).await;

        // Claim and process a single run by hand
        let job = f.pipeline.queue().claim().await.unwrap().unwrap();
        let disposition = crate::worker::process_job(f.pipeline.queue(), &handler_for(&f), job, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(disposition, JobDisposition::Reschedule(Duration::ZERO));

        let stored = f.harness.ctx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::PubLoading);
    }

    #[tokio::test]
    async fn test_transient_publish_error_is_retried() {
        let f = fixture(10).await;
        f.harness
            .api
            .fail_next(ops::PUBLISH_CONTAINER, PlatformError::Network("reset".to_string()));
        let task = start(&f, &["https://cdn.example/a.jpg"]).await;

        f.workers.drain().await.unwrap();

        assert!(f.harness.ctx.db.get_task(&task.id).await.unwrap().is_none());
        assert_eq!(f.harness.api.calls(ops::PUBLISH_CONTAINER), 2);
    }

    #[tokio::test]
    async fn test_lost_publish_response_is_not_published_twice() {
        let f = fixture(10).await;
        f.harness.api.lose_next_response(ops::PUBLISH_CONTAINER);
        let task = start(&f, &["https://cdn.example/a.jpg"]).await;

        assert_eq!(f.workers.drain().await.unwrap(), 2);

        assert_eq!(f.harness.api.calls(ops::PUBLISH_CONTAINER), 1);
        let db = &f.harness.ctx.db;
        assert!(db.get_task(&task.id).await.unwrap().is_none());
        let records = db.records_for_task(&task.id).await.unwrap();
        assert_eq!(records[0].destination_content_id, "media-container-1");
    }

    #[tokio::test]
    async fn test_retried_video_tweet_is_found_not_reposted() {
        let f = fixture_for(Destination::Twitter, 10).await;
        f.harness.api.lose_next_response(ops::CREATE_POST);
        let task = start_with(&f, video("https://cdn.example/clip.mp4")).await;

        f.workers.drain().await.unwrap();

        assert_eq!(f.harness.api.calls(ops::CREATE_POST), 1);
        assert_eq!(f.harness.api.calls(ops::FIND_POST), 1);
        let records = f.harness.ctx.db.records_for_task(&task.id).await.unwrap();
        assert_eq!(records[0].destination_content_id, "post-1");
    }

    #[tokio::test]
    async fn test_first_finalize_skips_lookup() {
        let f = fixture_for(Destination::Twitter, 10).await;
        start_with(&f, video("https://cdn.example/clip.mp4")).await;

        f.workers.drain().await.unwrap();

        assert_eq!(f.harness.api.calls(ops::FIND_POST), 0);
        assert_eq!(f.harness.api.calls(ops::CREATE_POST), 1);
    }

    #[tokio::test]
    async fn test_ensure_polling_is_idempotent() {
        let f = fixture(10).await;
        let task = start(&f, &["https://cdn.example/a.jpg"]).await;

        let again = f.pipeline.ensure_polling(&task).await.unwrap();
        assert!(matches!(again, EnqueueOutcome::AlreadyQueued(_)));
        assert_eq!(f.pipeline.queue().stats().await.unwrap().waiting, 1);
    }

    fn handler_for(f: &Fixture) -> MediaPollHandler {
        let mut publishers = PublisherRegistry::new();
        publishers.register(f.publisher.clone());
        MediaPollHandler::new(
            f.harness.ctx.db.clone(),
            publishers,
            CompletionHandler::new(f.harness.ctx.db.clone(), EventBus::default()),
            &f.pipeline,
            10,
        )
    }
}

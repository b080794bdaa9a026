//! Edits of published posts
//!
//! An edit targets the publish record of a finished task. The latest edit is
//! stored per task and one job on the update queue pushes it to the
//! destination; a second edit made while the job is still waiting replaces
//! the stored edit and rides on the same job. The record's content is
//! rewritten only once the destination accepted the edit.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::db::Database;
use crate::error::Result;
use crate::publishers::{PubOutcome, PublisherRegistry};
use crate::queue::{Backoff, EnqueueOutcome, Job, JobQueue, JobSpec, JobState, QueueName, RetryPolicy};
use crate::types::{EditStatus, PublishRecord};
use crate::worker::{JobDisposition, JobHandler};

/// The update queue, addressed by publish record
#[derive(Clone)]
pub struct PostUpdates {
    queue: JobQueue,
    policy: RetryPolicy,
}

impl PostUpdates {
    pub fn new(db: Database, config: &QueueConfig) -> Self {
        Self {
            queue: JobQueue::new(db, QueueName::Update),
            policy: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                backoff: Backoff::Exponential(config.backoff_base()),
            },
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn job_id(record: &PublishRecord) -> String {
        format!("{}:update", record.queue_job_id)
    }

    pub async fn job(&self, record: &PublishRecord) -> Result<Option<Job>> {
        self.queue.get(&Self::job_id(record)).await
    }

    /// Queue the stored edit of `record` for delivery
    ///
    /// A failed job from an earlier edit is replaced.
    pub async fn enqueue(&self, record: &PublishRecord) -> Result<EnqueueOutcome> {
        let spec = JobSpec {
            id: Self::job_id(record),
            task_id: record.task_id.clone(),
            policy: self.policy,
            delay: Duration::ZERO,
        };

        match self.queue.enqueue(&spec).await? {
            EnqueueOutcome::AlreadyQueued(JobState::Failed) => {
                self.queue.remove(&spec.id).await?;
                let outcome = self.queue.enqueue(&spec).await?;
                debug!(task_id = %record.task_id, "Replaced failed update job");
                Ok(outcome)
            }
            outcome => Ok(outcome),
        }
    }
}

/// Update queue handler
pub struct UpdateJobHandler {
    db: Database,
    publishers: PublisherRegistry,
}

impl UpdateJobHandler {
    pub fn new(db: Database, publishers: PublisherRegistry) -> Self {
        Self { db, publishers }
    }

    async fn fail(&self, task_id: &str, message: &str) -> Result<JobDisposition> {
        self.db
            .finish_post_edit(task_id, EditStatus::Failed, Some(message))
            .await?;
        warn!(task_id, error = message, "Post edit failed");
        Ok(JobDisposition::Fail(message.to_string()))
    }
}

#[async_trait]
impl JobHandler for UpdateJobHandler {
    fn queue(&self) -> QueueName {
        QueueName::Update
    }

    async fn handle(&self, job: &Job) -> Result<JobDisposition> {
        let edit = match self.db.get_post_edit(&job.task_id).await? {
            Some(edit) if edit.status == EditStatus::Pending => edit,
            _ => {
                debug!(job_id = %job.id, task_id = %job.task_id, "No pending edit, dropping job");
                return Ok(JobDisposition::Complete);
            }
        };
        let record = match self.db.published_record(&job.task_id).await? {
            Some(record) => record,
            None => return self.fail(&job.task_id, "published post no longer exists").await,
        };
        let publisher = match self.publishers.get(record.destination) {
            Some(publisher) => publisher,
            None => {
                let message = format!("no publisher registered for {}", record.destination);
                return self.fail(&job.task_id, &message).await;
            }
        };

        info!(
            task_id = %record.task_id,
            destination = %record.destination,
            content_id = %record.destination_content_id,
            attempt = job.attempts,
            "Editing published post"
        );

        match publisher.update_published(&record, &edit.edit).await? {
            PubOutcome::Published(content) | PubOutcome::Submitted(content) => {
                let content_ref = edit.edit.apply(&record.content);
                self.db
                    .apply_post_edit(&record.task_id, &content_ref, content.permalink.as_deref())
                    .await?;
                Ok(JobDisposition::Complete)
            }
            PubOutcome::Processing => {
                // Edits never create media containers
                self.fail(&job.task_id, "destination started processing media for an edit")
                    .await
            }
            PubOutcome::Failed { message, no_retry: true } => self.fail(&job.task_id, &message).await,
            PubOutcome::Failed { message, .. } => Ok(JobDisposition::Retry(message)),
        }
    }

    async fn on_exhausted(&self, job: &Job, error: &str) -> Result<()> {
        self.db
            .finish_post_edit(&job.task_id, EditStatus::Failed, Some(error))
            .await?;
        Ok(())
    }
}

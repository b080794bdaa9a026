//! Task completion
//!
//! Every terminal transition goes through [`CompletionHandler`]: a published
//! task becomes a publish record and disappears from the task table in one
//! transaction, a failed task is marked FAIL exactly once, and both emit an
//! [`Event`] for side-effect consumers.
//!
//! Destinations that finish asynchronously (TikTok) are completed here too,
//! from the webhook events their adapters decode.

use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::publishers::Publisher;
use crate::types::{Destination, PublishRecord, PublishTask, PublishedContent, RecordStatus};

/// A destination's report about content it accepted earlier
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub destination: Destination,
    /// Id returned when the content was submitted
    pub content_id: String,
    pub kind: WebhookKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookKind {
    Published,
    /// Published and visible; `post_id` is the public post id when known
    PubliclyAvailable { post_id: Option<String> },
    Failed { reason: String },
}

#[derive(Clone)]
pub struct CompletionHandler {
    db: Database,
    events: EventBus,
}

impl CompletionHandler {
    pub fn new(db: Database, events: EventBus) -> Self {
        Self { db, events }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Record a published task and remove it from the task table
    pub async fn complete(&self, task: &PublishTask, content: &PublishedContent) -> Result<PublishRecord> {
        let mut record = PublishRecord::from_task(task, content, RecordStatus::Published);
        record.id = Some(self.db.finish_task(&record).await?);

        info!(
            task_id = %task.id,
            destination = %task.destination,
            content_id = %content.content_id,
            "Task published"
        );
        self.emit_published(&record);
        Ok(record)
    }

    /// Remember content the destination accepted but has not finished publishing
    pub async fn record_submitted(&self, task: &PublishTask, content: &PublishedContent) -> Result<PublishRecord> {
        let mut record = PublishRecord::from_task(task, content, RecordStatus::Publishing);
        record.id = Some(self.db.upsert_publish_record(&record).await?);

        info!(
            task_id = %task.id,
            destination = %task.destination,
            content_id = %content.content_id,
            "Task submitted, waiting for destination"
        );
        Ok(record)
    }

    /// Mark a task FAIL. Returns false when it was already terminal or gone.
    pub async fn fail(&self, task: &PublishTask, message: &str) -> Result<bool> {
        self.fail_by_id(&task.id, &task.owner_id, task.destination, message)
            .await
    }

    async fn fail_by_id(&self, task_id: &str, owner_id: &str, destination: Destination, message: &str) -> Result<bool> {
        if !self.db.fail_task(task_id, message).await? {
            debug!(task_id = %task_id, "Task already terminal, not failing again");
            return Ok(false);
        }

        warn!(task_id = %task_id, destination = %destination, error = %message, "Task failed");
        self.events.emit(Event::TaskFailed {
            task_id: task_id.to_string(),
            owner_id: owner_id.to_string(),
            destination,
            message: message.to_string(),
        });
        Ok(true)
    }

    /// Apply a decoded webhook to the record it refers to
    ///
    /// Returns the updated record, or `None` when no record matches the
    /// event's content id. Replayed events are harmless.
    pub async fn apply_webhook(&self, event: &WebhookEvent, publisher: &dyn Publisher) -> Result<Option<PublishRecord>> {
        let mut record = match self
            .db
            .find_publish_record(event.destination, &event.content_id)
            .await?
        {
            Some(record) => record,
            None => {
                warn!(
                    destination = %event.destination,
                    content_id = %event.content_id,
                    "Webhook for unknown content"
                );
                return Ok(None);
            }
        };
        let was_published = record.status == RecordStatus::Published;

        match &event.kind {
            WebhookKind::Published | WebhookKind::PubliclyAvailable { .. } => {
                if let WebhookKind::PubliclyAvailable { post_id: Some(post_id) } = &event.kind {
                    if let Some(permalink) = publisher.permalink(&record.destination_uid, post_id) {
                        record.permalink = Some(permalink);
                    }
                }
                record.status = RecordStatus::Published;
                record.error_message = None;
                self.db.finish_task(&record).await?;

                if was_published {
                    debug!(task_id = %record.task_id, "Webhook for already published content");
                } else {
                    info!(
                        task_id = %record.task_id,
                        destination = %record.destination,
                        content_id = %record.destination_content_id,
                        "Task published by webhook"
                    );
                    record.published_at = chrono::Utc::now().timestamp();
                    self.emit_published(&record);
                }
            }
            WebhookKind::Failed { reason } => {
                if was_published {
                    warn!(task_id = %record.task_id, reason = %reason, "Ignoring failure for published content");
                    return Ok(Some(record));
                }
                if let Some(id) = record.id {
                    self.db
                        .update_publish_record(id, RecordStatus::Failed, None, Some(reason))
                        .await?;
                }
                record.status = RecordStatus::Failed;
                record.error_message = Some(reason.clone());
                self.fail_by_id(&record.task_id, &record.owner_id, record.destination, reason)
                    .await?;
            }
        }

        Ok(Some(record))
    }

    fn emit_published(&self, record: &PublishRecord) {
        self.events.emit(Event::TaskPublished {
            task_id: record.task_id.clone(),
            owner_id: record.owner_id.clone(),
            account_id: record.account_id.clone(),
            destination: record.destination,
            destination_content_id: record.destination_content_id.clone(),
            permalink: record.permalink.clone(),
            published_at: record.published_at,
        });
    }
}

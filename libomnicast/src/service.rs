//! Service facade for Omnicast
//!
//! `PublishingService` is the inbound interface of the orchestrator. It owns
//! the shared collaborators (store, account registry, publisher registry,
//! queues) and exposes the task operations used by the binaries: create,
//! cancel, reschedule, publish now, edits of published posts, webhook intake
//! and queries.
//!
//! The same instance hands out the scheduler and the worker pools, so a
//! daemon and a one-shot CLI share one wiring.
//!
//! # Example
//!
//! ```no_run
//! use libomnicast::service::{CreateTaskRequest, PublishingService};
//! use libomnicast::types::{ContentRefs, Destination, DestinationOptions};
//! use libomnicast::Config;
//!
//! # async fn example() -> libomnicast::Result<()> {
//! let service = PublishingService::from_config(Config::load()?).await?;
//!
//! let task = service
//!     .create_publish_task(CreateTaskRequest {
//!         account_id: "acc-1".to_string(),
//!         destination: Destination::Youtube,
//!         content: ContentRefs {
//!             video_url: Some("https://cdn.example/launch.mp4".to_string()),
//!             title: Some("Launch".to_string()),
//!             ..Default::default()
//!         },
//!         scheduled_at: chrono::Utc::now().timestamp() + 3600,
//!         options: DestinationOptions::default(),
//!     })
//!     .await?;
//! println!("scheduled {}", task.id);
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::accounts::{AccountRegistry, StaticAccounts};
use crate::completion::CompletionHandler;
use crate::config::Config;
use crate::credentials::AuthCheck;
use crate::db::{Database, TaskFilter};
use crate::dispatch::{DispatchQueue, PublishJobHandler};
use crate::error::{OmnicastError, Result};
use crate::events::EventBus;
use crate::pipeline::{MediaPipeline, MediaPollHandler};
use crate::publishers::{create_publishers, PublisherRegistry};
use crate::queue::{EnqueueOutcome, JobState, QueueStats, RemoveOutcome};
use crate::scheduler::Scheduler;
use crate::types::{
    ContentCategory, ContentRefs, Destination, DestinationOptions, MetaOptions, PostEdit, PostEditRecord,
    PublishRecord, PublishTask, TaskStatus,
};
use crate::update::{PostUpdates, UpdateJobHandler};
use crate::worker::WorkerPool;

/// Inbound request to publish content to one account
#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub account_id: String,
    pub destination: Destination,
    pub content: ContentRefs,
    /// Unix seconds
    pub scheduled_at: i64,
    pub options: DestinationOptions,
}

/// What `publish_now` did with the task's job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishNow {
    /// The pending job was moved to the front of the queue
    Promoted,
    /// No job existed yet; one was added to run immediately
    Enqueued,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub publish_queue: QueueStats,
    pub media_queue: QueueStats,
    pub update_queue: QueueStats,
    pub tasks: Vec<(TaskStatus, i64)>,
}

pub struct PublishingService {
    db: Database,
    config: Arc<Config>,
    accounts: Arc<dyn AccountRegistry>,
    publishers: PublisherRegistry,
    dispatch: DispatchQueue,
    pipeline: MediaPipeline,
    updates: PostUpdates,
    completion: CompletionHandler,
}

impl PublishingService {
    /// Open the store and build every collaborator from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated, or a
    /// destination gateway or account entry is invalid.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let db = Database::new(&config.database.path).await?;
        let accounts = Arc::new(StaticAccounts::from_config(&config)?);
        let (publishers, _credentials) = create_publishers(&config, &db)?;
        Ok(Self::new(db, config, accounts, publishers, EventBus::default()))
    }

    /// Wire a service from already-built parts
    pub fn new(
        db: Database,
        config: Config,
        accounts: Arc<dyn AccountRegistry>,
        publishers: PublisherRegistry,
        events: EventBus,
    ) -> Self {
        let dispatch = DispatchQueue::new(db.clone(), &config.queue);
        let pipeline = MediaPipeline::new(db.clone(), &config.media);
        let updates = PostUpdates::new(db.clone(), &config.queue);
        let completion = CompletionHandler::new(db.clone(), events);
        Self {
            db,
            config: Arc::new(config),
            accounts,
            publishers,
            dispatch,
            pipeline,
            updates,
            completion,
        }
    }

    /// Replace the media pipeline, e.g. to poll without delay
    pub fn with_pipeline(mut self, pipeline: MediaPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        self.completion.events()
    }

    pub fn publishers(&self) -> &PublisherRegistry {
        &self.publishers
    }

    pub fn dispatch(&self) -> &DispatchQueue {
        &self.dispatch
    }

    pub fn pipeline(&self) -> &MediaPipeline {
        &self.pipeline
    }

    pub fn updates(&self) -> &PostUpdates {
        &self.updates
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.db.clone(),
            self.dispatch.clone(),
            &self.pipeline,
            &self.config.scheduler,
            &self.config.queue,
        )
        .with_queue(self.updates.queue().clone())
    }

    /// Worker pool for the publish queue
    pub fn publish_workers(&self) -> WorkerPool {
        let handler = PublishJobHandler::new(
            self.db.clone(),
            self.publishers.clone(),
            self.completion.clone(),
            self.pipeline.clone(),
        );
        WorkerPool::new(
            self.dispatch.queue().clone(),
            Arc::new(handler),
            self.config.queue.concurrency,
            self.config.queue.poll_interval(),
        )
        .with_heartbeat(self.config.queue.heartbeat())
    }

    /// Worker pool for the media polling queue
    pub fn media_workers(&self) -> WorkerPool {
        let handler = MediaPollHandler::new(
            self.db.clone(),
            self.publishers.clone(),
            self.completion.clone(),
            &self.pipeline,
            self.config.media.max_polls,
        );
        WorkerPool::new(
            self.pipeline.queue().clone(),
            Arc::new(handler),
            self.config.queue.concurrency,
            self.config.queue.poll_interval(),
        )
        .with_heartbeat(self.config.queue.heartbeat())
    }

    /// Worker pool for edits of published posts
    pub fn update_workers(&self) -> WorkerPool {
        let handler = UpdateJobHandler::new(self.db.clone(), self.publishers.clone());
        WorkerPool::new(
            self.updates.queue().clone(),
            Arc::new(handler),
            self.config.queue.concurrency,
            self.config.queue.poll_interval(),
        )
        .with_heartbeat(self.config.queue.heartbeat())
    }

    /// Store a new task and enqueue it right away when it is due soon
    ///
    /// # Errors
    ///
    /// - `NotFound` if the account does not exist
    /// - `InvalidInput` if the account belongs to another destination, the
    ///   content is empty, or no publisher serves the destination
    pub async fn create_publish_task(&self, request: CreateTaskRequest) -> Result<PublishTask> {
        let account = self
            .accounts
            .get_account(&request.account_id)
            .await?
            .ok_or_else(|| OmnicastError::NotFound(format!("account {}", request.account_id)))?;

        if account.destination != request.destination {
            return Err(OmnicastError::InvalidInput(format!(
                "account {} is a {} account, not {}",
                account.id, account.destination, request.destination
            )));
        }
        if request.content.is_empty() {
            return Err(OmnicastError::InvalidInput("content cannot be empty".to_string()));
        }
        if self.publishers.get(request.destination).is_none() {
            return Err(OmnicastError::InvalidInput(format!(
                "no publisher configured for {}",
                request.destination
            )));
        }

        let mut task = PublishTask::new(&account, request.content, request.scheduled_at);
        task.options = with_default_options(request.destination, &task.content, request.options);
        self.db.create_task(&task).await?;

        info!(
            task_id = %task.id,
            account_id = %task.account_id,
            destination = %task.destination,
            scheduled_at = task.scheduled_at,
            "Publish task created"
        );

        let lead = task.scheduled_at - chrono::Utc::now().timestamp();
        if lead <= self.config.scheduler.immediate_threshold().as_secs() as i64 {
            self.dispatch.enqueue(&task).await?;
        }
        Ok(task)
    }

    /// Delete a task owned by `owner_id` and drop its pending jobs
    ///
    /// A job that is already running is left alone; it finds the task gone
    /// and ends without touching it. Returns false when no such task exists.
    pub async fn cancel_task(&self, task_id: &str, owner_id: &str) -> Result<bool> {
        let task = match self.owned_task(task_id, owner_id).await? {
            Some(task) => task,
            None => return Ok(false),
        };

        if self.dispatch.remove(&task).await? == RemoveOutcome::Active {
            warn!(task_id = %task.id, "Cancelling task while its publish job is running");
        }
        self.pipeline.discard(&task).await?;
        self.db.delete_containers_for_task(&task.id).await?;

        let deleted = self.db.delete_task(&task.id, owner_id).await?;
        if deleted {
            info!(task_id = %task.id, "Task cancelled");
        }
        Ok(deleted)
    }

    /// Move a waiting task to `scheduled_at`
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the task is already being published.
    pub async fn reschedule_task(&self, task_id: &str, scheduled_at: i64, owner_id: &str) -> Result<bool> {
        let mut task = match self.owned_task(task_id, owner_id).await? {
            Some(task) => task,
            None => return Ok(false),
        };
        if task.status != TaskStatus::Waiting {
            return Err(OmnicastError::Conflict(format!(
                "task is {}, only waiting tasks can be rescheduled",
                task.status
            )));
        }
        if self.dispatch.remove(&task).await? == RemoveOutcome::Active {
            return Err(OmnicastError::Conflict("task is in progress".to_string()));
        }

        if !self.db.update_task_schedule(&task.id, owner_id, scheduled_at).await? {
            return Ok(false);
        }
        task.scheduled_at = scheduled_at;
        info!(task_id = %task.id, scheduled_at, "Task rescheduled");

        let lead = scheduled_at - chrono::Utc::now().timestamp();
        if lead <= self.config.scheduler.immediate_threshold().as_secs() as i64 {
            self.dispatch.enqueue(&task).await?;
        }
        Ok(true)
    }

    /// Publish a waiting task as soon as a worker is free
    ///
    /// # Errors
    ///
    /// - `NotFound` if the task does not exist
    /// - `Conflict` if the task is not waiting or its job is already running
    pub async fn publish_now(&self, task_id: &str) -> Result<PublishNow> {
        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or_else(|| OmnicastError::NotFound(format!("task {}", task_id)))?;
        if task.status != TaskStatus::Waiting {
            return Err(OmnicastError::Conflict(format!("task is {}", task.status)));
        }

        if self.dispatch.promote(&task).await? {
            info!(task_id = %task.id, "Task promoted to run now");
            return Ok(PublishNow::Promoted);
        }

        match self.dispatch.enqueue_now(&task).await? {
            EnqueueOutcome::Added => Ok(PublishNow::Enqueued),
            EnqueueOutcome::AlreadyQueued(JobState::Failed) => {
                // Left over from an earlier run; a waiting task deserves a fresh job
                self.dispatch.remove(&task).await?;
                self.dispatch.enqueue_now(&task).await?;
                Ok(PublishNow::Enqueued)
            }
            EnqueueOutcome::AlreadyQueued(_) => Err(OmnicastError::Conflict("task is in progress".to_string())),
        }
    }

    /// Edit the text and metadata of a post that has been published
    ///
    /// The edit is stored and delivered by the update queue; the returned
    /// entry starts out pending. A later edit replaces one that has not been
    /// delivered yet.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the edit changes nothing or the destination cannot
    ///   edit this post
    /// - `Conflict` if the task has not been published yet or an edit is
    ///   being delivered right now
    /// - `NotFound` if no published post of `owner_id` exists for the task
    pub async fn update_published_post(&self, task_id: &str, owner_id: &str, edit: PostEdit) -> Result<PostEditRecord> {
        if edit.is_empty() {
            return Err(OmnicastError::InvalidInput("edit changes nothing".to_string()));
        }
        if self.owned_task(task_id, owner_id).await?.is_some() {
            return Err(OmnicastError::Conflict("task has not been published yet".to_string()));
        }
        let record = self
            .db
            .published_record(task_id)
            .await?
            .filter(|record| record.owner_id == owner_id)
            .ok_or_else(|| OmnicastError::NotFound(format!("published post for task {}", task_id)))?;
        let publisher = self
            .publishers
            .get(record.destination)
            .ok_or_else(|| OmnicastError::InvalidInput(format!("no publisher configured for {}", record.destination)))?;
        publisher.check_update(&record)?;

        if let Some(job) = self.updates.job(&record).await? {
            if job.state == JobState::Active {
                return Err(OmnicastError::Conflict("an edit of this post is in progress".to_string()));
            }
        }

        let stored = self.db.upsert_post_edit(task_id, owner_id, &edit).await?;
        self.updates.enqueue(&record).await?;
        info!(
            task_id,
            destination = %record.destination,
            content_id = %record.destination_content_id,
            "Post edit queued"
        );
        Ok(stored)
    }

    /// Latest edit requested for a published task
    pub async fn post_edit(&self, task_id: &str) -> Result<Option<PostEditRecord>> {
        self.db.get_post_edit(task_id).await
    }

    /// Feed a destination webhook body to the matching publish record
    ///
    /// Returns the updated record, or `None` when the event is not one the
    /// orchestrator tracks.
    pub async fn handle_webhook(&self, destination: Destination, body: &str) -> Result<Option<PublishRecord>> {
        let publisher = self
            .publishers
            .get(destination)
            .ok_or_else(|| OmnicastError::InvalidInput(format!("no publisher configured for {}", destination)))?;

        match publisher.parse_webhook(body)? {
            Some(event) => self.completion.apply_webhook(&event, publisher.as_ref()).await,
            None => {
                debug!(destination = %destination, "Webhook carried no publish event");
                Ok(None)
            }
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<PublishTask>> {
        self.db.get_task(task_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<PublishTask>> {
        self.db.list_tasks(filter).await
    }

    pub async fn list_records(&self, owner_id: Option<&str>, limit: usize) -> Result<Vec<PublishRecord>> {
        self.db.list_publish_records(owner_id, limit).await
    }

    /// Authorization state of an account, as its publisher sees it
    pub async fn check_account_auth(&self, account_id: &str) -> Result<AuthCheck> {
        let account = self
            .accounts
            .get_account(account_id)
            .await?
            .ok_or_else(|| OmnicastError::NotFound(format!("account {}", account_id)))?;
        let publisher = self
            .publishers
            .get(account.destination)
            .ok_or_else(|| OmnicastError::InvalidInput(format!("no publisher configured for {}", account.destination)))?;
        publisher.check_auth(&account.id).await
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        Ok(ServiceStats {
            publish_queue: self.dispatch.queue().stats().await?,
            media_queue: self.pipeline.queue().stats().await?,
            update_queue: self.updates.queue().stats().await?,
            tasks: self.db.count_tasks_by_status().await?,
        })
    }

    async fn owned_task(&self, task_id: &str, owner_id: &str) -> Result<Option<PublishTask>> {
        Ok(self
            .db
            .get_task(task_id)
            .await?
            .filter(|task| task.owner_id == owner_id))
    }
}

/// Fill in the content category for destinations that need one
fn with_default_options(
    destination: Destination,
    content: &ContentRefs,
    mut options: DestinationOptions,
) -> DestinationOptions {
    match destination {
        Destination::Instagram => {
            let meta = options.instagram.get_or_insert_with(MetaOptions::default);
            if meta.category.is_none() {
                meta.category = Some(if content.has_video() {
                    ContentCategory::Reel
                } else {
                    ContentCategory::Post
                });
            }
        }
        Destination::Facebook => {
            let meta = options.facebook.get_or_insert_with(MetaOptions::default);
            meta.category.get_or_insert(ContentCategory::Post);
        }
        _ => {}
    }
    options
}

//! Publisher abstraction and destination adapters
//!
//! Every destination implements [`Publisher`]. The dispatcher only ever sees
//! `Arc<dyn Publisher>` values looked up in a [`PublisherRegistry`], which is
//! built once at startup and passed around explicitly.
//!
//! Adapters come in three shapes:
//!
//! - synchronous: the post exists when `do_pub` returns (Twitter text and
//!   images, Facebook text and photos, Bilibili, YouTube)
//! - submitted: the destination accepted the upload and reports completion
//!   later through a webhook (TikTok)
//! - asynchronous: media containers are created and the Media Pipeline polls
//!   them until they can be published (Instagram, Threads, Facebook video,
//!   Twitter video)
//!
//! # Examples
//!
//! ```no_run
//! use libomnicast::config::Config;
//! use libomnicast::db::Database;
//! use libomnicast::publishers::create_publishers;
//! use libomnicast::types::Destination;
//!
//! # async fn example() -> libomnicast::error::Result<()> {
//! let config = Config::load()?;
//! let db = Database::new(&config.database.path).await?;
//! let (registry, _credentials) = create_publishers(&config, &db)?;
//!
//! if let Some(publisher) = registry.get(Destination::Youtube) {
//!     let check = publisher.check_auth("account-1").await?;
//!     println!("youtube authorized: {}", check.is_ok());
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::api::gateway::{GatewayClient, HttpMediaSource};
use crate::api::{ContainerApi, ContainerRequest, MediaSource, PlatformApi};
use crate::completion::WebhookEvent;
use crate::config::Config;
use crate::credentials::{AuthCheck, CredentialCache};
use crate::db::Database;
use crate::error::{OmnicastError, PlatformError, Result};
use crate::types::{
    ContainerStatus, Destination, MediaContainer, PostEdit, PublishRecord, PublishTask, PublishedContent,
};

pub mod bilibili;
pub mod facebook;
pub mod instagram;
pub mod segmented;
pub mod threads;
pub mod tiktok;
pub mod twitter;
pub mod youtube;

/// Timeout for reading source media; segments can be several megabytes
const MEDIA_SOURCE_TIMEOUT: Duration = Duration::from_secs(300);

/// Tagged result of a publish attempt
#[derive(Debug, Clone, PartialEq)]
pub enum PubOutcome {
    /// The post exists at the destination
    Published(PublishedContent),
    /// The destination accepted the content; completion arrives by webhook
    Submitted(PublishedContent),
    /// Media containers were created and are being processed remotely
    Processing,
    Failed { message: String, no_retry: bool },
}

impl PubOutcome {
    /// A failure worth another attempt
    pub fn retryable(message: impl Into<String>) -> Self {
        PubOutcome::Failed {
            message: message.into(),
            no_retry: false,
        }
    }

    /// A failure that must not be retried
    pub fn rejected(message: impl Into<String>) -> Self {
        PubOutcome::Failed {
            message: message.into(),
            no_retry: true,
        }
    }

    /// Fold an expected failure into a tagged outcome
    ///
    /// Transient platform errors stay retryable; every other platform error,
    /// including an expired authorization, is terminal. Store errors are not
    /// expected failures and are returned unchanged.
    pub fn from_error(error: OmnicastError) -> Result<Self> {
        match error {
            OmnicastError::Platform(e) => Ok(PubOutcome::Failed {
                no_retry: !e.is_transient(),
                message: e.to_string(),
            }),
            OmnicastError::InvalidInput(message) => Ok(PubOutcome::rejected(message)),
            other => Err(other),
        }
    }
}

/// Per-destination publish contract
#[async_trait]
pub trait Publisher: Send + Sync {
    fn destination(&self) -> Destination;

    /// Cheap, side-effect-free authorization check
    async fn check_auth(&self, account_id: &str) -> Result<AuthCheck>;

    /// Perform or initiate the publish
    ///
    /// Expected failures (bad content, rejected request, expired authorization,
    /// transient network trouble) are returned as [`PubOutcome::Failed`]. Only
    /// store errors escape as `Err`. Calling this again for the same task must
    /// not create a second post where the adapter can tell.
    async fn do_pub(&self, task: &PublishTask) -> Result<PubOutcome>;

    /// Look for a post an earlier attempt already created
    ///
    /// The dispatcher calls this before every retry. The default answers from
    /// the destination content id stored on the task.
    async fn find_existing(&self, task: &PublishTask) -> Result<Option<PublishedContent>> {
        Ok(task
            .destination_content_id
            .as_ref()
            .map(|id| PublishedContent::new(id.clone())))
    }

    /// Current processing status of one media container
    async fn container_status(&self, task: &PublishTask, container: &MediaContainer) -> Result<ContainerStatus> {
        let _ = (task, container);
        Err(PlatformError::NotImplemented(format!("{} does not use media containers", self.destination())).into())
    }

    /// Publish once every container of the task has finished processing
    async fn finalize(&self, task: &PublishTask, containers: &[MediaContainer]) -> Result<PubOutcome> {
        let _ = (task, containers);
        Err(PlatformError::NotImplemented(format!("{} does not use media containers", self.destination())).into())
    }

    /// Whether a published post can take a text and metadata edit
    fn check_update(&self, record: &PublishRecord) -> Result<()> {
        let _ = record;
        Err(OmnicastError::InvalidInput(format!(
            "{} does not support editing published posts",
            self.destination()
        )))
    }

    /// Push an edit of a published post to the destination
    ///
    /// Failures are folded into [`PubOutcome::Failed`] the same way `do_pub`
    /// folds them.
    async fn update_published(&self, record: &PublishRecord, edit: &PostEdit) -> Result<PubOutcome> {
        let _ = edit;
        match self.check_update(record) {
            Ok(()) => Ok(PubOutcome::rejected(format!("{} has no post editor", self.destination()))),
            Err(e) => PubOutcome::from_error(e),
        }
    }

    /// Decode a completion webhook body. `Ok(None)` means the event is not
    /// one this adapter acts on.
    fn parse_webhook(&self, body: &str) -> Result<Option<WebhookEvent>> {
        let _ = body;
        Err(PlatformError::NotImplemented(format!("{} does not send publish webhooks", self.destination())).into())
    }

    /// Public URL of a post, when it can be derived from its id
    fn permalink(&self, destination_uid: &str, content_id: &str) -> Option<String> {
        let _ = (destination_uid, content_id);
        None
    }
}

/// Collaborators shared by every adapter
#[derive(Clone)]
pub struct PublisherContext {
    pub db: Database,
    pub credentials: Arc<CredentialCache>,
    pub source: Arc<dyn MediaSource>,
    pub chunk_size: u64,
}

impl PublisherContext {
    pub async fn check_auth(&self, account_id: &str, destination: Destination) -> Result<AuthCheck> {
        self.credentials.auth_status(account_id, destination).await
    }

    /// Record a destination container so the Media Pipeline can poll it
    pub async fn track_container(
        &self,
        task: &PublishTask,
        destination_container_id: String,
        position: i64,
    ) -> Result<MediaContainer> {
        let container = MediaContainer::new(task, destination_container_id, position);
        self.db.create_container(&container).await?;
        debug!(
            task_id = %task.id,
            container_id = %container.destination_container_id,
            position,
            "Tracking media container"
        );
        Ok(container)
    }

    /// Containers created by an earlier attempt, in position order
    pub async fn existing_containers(&self, task: &PublishTask) -> Result<Vec<MediaContainer>> {
        self.db.containers_for_task(&task.id).await
    }

    /// Create one container per request, skipping the ones an earlier
    /// attempt already created and tracked. Returns every tracked container.
    pub(crate) async fn create_containers<A>(
        &self,
        api: &A,
        task: &PublishTask,
        requests: &[ContainerRequest],
    ) -> Result<Vec<MediaContainer>>
    where
        A: ContainerApi + ?Sized,
    {
        let mut containers = self.existing_containers(task).await?;
        for (position, request) in requests.iter().enumerate().skip(containers.len()) {
            let container_id = self
                .credentials
                .with_token(&task.account_id, task.destination, |token| async move {
                    api.create_container(&token, request).await
                })
                .await?;
            containers.push(self.track_container(task, container_id, position as i64).await?);
        }
        Ok(containers)
    }

    /// Media an earlier attempt published from the task's containers
    ///
    /// Answers from the stored content id when there is one, otherwise asks
    /// the destination about the first tracked container. A carousel child
    /// resolves to the carousel it was published in.
    pub(crate) async fn find_published<A>(&self, api: &A, task: &PublishTask) -> Result<Option<PublishedContent>>
    where
        A: ContainerApi + ?Sized,
    {
        if let Some(id) = &task.destination_content_id {
            return Ok(Some(PublishedContent::new(id.clone())));
        }
        let containers = self.existing_containers(task).await?;
        let Some(first) = containers.first() else {
            return Ok(None);
        };

        let container_id = first.destination_container_id.as_str();
        self.credentials
            .with_token(&task.account_id, task.destination, |token| async move {
                api.find_published(&token, container_id).await
            })
            .await
    }

    /// Poll a container through the destination's container API
    pub(crate) async fn poll_container<A>(
        &self,
        api: &A,
        task: &PublishTask,
        container: &MediaContainer,
        map_status: fn(&str) -> ContainerStatus,
    ) -> Result<ContainerStatus>
    where
        A: ContainerApi + ?Sized,
    {
        let container_id = container.destination_container_id.as_str();
        let raw = self
            .credentials
            .with_token(&task.account_id, task.destination, |token| async move {
                api.container_status(&token, container_id).await
            })
            .await?;

        let status = map_status(&raw);
        debug!(task_id = %task.id, container_id, raw = %raw, status = status.as_str(), "Container status");
        Ok(status)
    }
}

/// Video URL of a task, or a validation error naming the destination
pub(crate) fn require_video(task: &PublishTask) -> Result<&str> {
    task.content.video_url.as_deref().ok_or_else(|| {
        PlatformError::Validation(format!("{} requires a video", task.destination)).into()
    })
}

/// Destination type to publisher map
#[derive(Clone, Default)]
pub struct PublisherRegistry {
    publishers: HashMap<Destination, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a publisher, replacing any earlier one for the same destination
    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers.insert(publisher.destination(), publisher);
    }

    pub fn get(&self, destination: Destination) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(&destination).cloned()
    }

    pub fn destinations(&self) -> Vec<Destination> {
        let mut destinations: Vec<Destination> = self.publishers.keys().copied().collect();
        destinations.sort();
        destinations
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

/// Build the adapter for `destination` on top of `api`
pub fn create_publisher(
    destination: Destination,
    ctx: PublisherContext,
    api: Arc<dyn PlatformApi>,
) -> Arc<dyn Publisher> {
    match destination {
        Destination::Bilibili => Arc::new(bilibili::BilibiliPublisher::new(ctx, api)),
        Destination::Youtube => Arc::new(youtube::YoutubePublisher::new(ctx, api)),
        Destination::Tiktok => Arc::new(tiktok::TiktokPublisher::new(ctx, api)),
        Destination::Twitter => Arc::new(twitter::TwitterPublisher::new(ctx, api)),
        Destination::Instagram => Arc::new(instagram::InstagramPublisher::new(ctx, api)),
        Destination::Threads => Arc::new(threads::ThreadsPublisher::new(ctx, api)),
        Destination::Facebook => Arc::new(facebook::FacebookPublisher::new(ctx, api)),
    }
}

/// Build the registry and credential cache from configuration
///
/// One HTTP gateway client is created per enabled `[destinations.<name>]`
/// section. It serves as the destination's token endpoint and as the API the
/// adapter publishes through.
pub fn create_publishers(config: &Config, db: &Database) -> Result<(PublisherRegistry, Arc<CredentialCache>)> {
    let source: Arc<dyn MediaSource> = Arc::new(HttpMediaSource::new(MEDIA_SOURCE_TIMEOUT)?);
    let mut credentials = CredentialCache::new(
        db.clone(),
        Duration::from_secs(config.credentials.refresh_margin_secs),
    );

    let mut clients = Vec::new();
    for destination in Destination::ALL {
        let Some(destination_config) = config.destination(destination) else {
            debug!(destination = %destination, "No gateway configured, skipping");
            continue;
        };
        if !destination_config.enabled {
            info!(destination = %destination, "Destination disabled in config");
            continue;
        }

        let client = Arc::new(GatewayClient::new(destination, destination_config)?);
        credentials = credentials.with_token_api(destination, client.clone());
        clients.push((destination, client));
    }

    let credentials = Arc::new(credentials);
    let ctx = PublisherContext {
        db: db.clone(),
        credentials: credentials.clone(),
        source,
        chunk_size: config.transfer.chunk_size_bytes,
    };

    let mut registry = PublisherRegistry::new();
    for (destination, client) in clients {
        registry.register(create_publisher(destination, ctx.clone(), client));
    }

    info!(destinations = ?registry.destinations(), "Publisher registry ready");
    Ok((registry, credentials))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for adapter tests

    use super::*;
    use crate::api::mock::MockApi;
    use crate::api::TokenGrant;
    use crate::types::{Account, ContentRefs};

    pub struct Harness {
        pub ctx: PublisherContext,
        pub api: MockApi,
    }

    pub async fn harness(destination: Destination) -> Harness {
        let db = Database::in_memory().await.unwrap();
        let api = MockApi::new(destination.as_str());
        let credentials = CredentialCache::new(db.clone(), Duration::from_secs(600))
            .with_token_api(destination, Arc::new(api.clone()));
        credentials
            .store_grant(
                "acc-1",
                destination,
                TokenGrant {
                    access_token: "token".to_string(),
                    refresh_token: Some("refresh".to_string()),
                    expires_in: 3600,
                    refresh_expires_in: None,
                },
            )
            .await
            .unwrap();

        Harness {
            ctx: PublisherContext {
                db,
                credentials: Arc::new(credentials),
                source: Arc::new(api.clone()),
                chunk_size: 5 * 1024 * 1024,
            },
            api,
        }
    }

    /// A task stored in the harness database
    pub async fn stored_task(harness: &Harness, destination: Destination, content: ContentRefs) -> PublishTask {
        let account = Account {
            id: "acc-1".to_string(),
            owner_id: "user-1".to_string(),
            destination,
            destination_uid: "creator".to_string(),
        };
        let task = PublishTask::new(&account, content, chrono::Utc::now().timestamp());
        harness.ctx.db.create_task(&task).await.unwrap();
        task
    }

    pub fn video(url: &str) -> ContentRefs {
        ContentRefs {
            video_url: Some(url.to_string()),
            title: Some("Launch".to_string()),
            description: Some("Our launch video".to_string()),
            topics: vec!["rust".to_string()],
            ..Default::default()
        }
    }

    pub fn images(urls: &[&str]) -> ContentRefs {
        ContentRefs {
            image_urls: urls.iter().map(|u| u.to_string()).collect(),
            description: Some("Gallery".to_string()),
            ..Default::default()
        }
    }
}

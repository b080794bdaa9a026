//! Threads adapter
//!
//! Same container flow as Instagram, with two differences: text-only posts
//! are containers too, and carousels may mix images and videos.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{PubOutcome, Publisher, PublisherContext};
use crate::api::{ContainerKind, ContainerRequest, PlatformApi};
use crate::credentials::AuthCheck;
use crate::error::{PlatformError, Result};
use crate::types::{ContainerStatus, Destination, MediaContainer, PublishTask, PublishedContent};

const MAX_TEXT_CHARS: usize = 500;
const MAX_CAROUSEL_ITEMS: usize = 20;

pub struct ThreadsPublisher {
    ctx: PublisherContext,
    api: Arc<dyn PlatformApi>,
}

impl ThreadsPublisher {
    pub fn new(ctx: PublisherContext, api: Arc<dyn PlatformApi>) -> Self {
        Self { ctx, api }
    }

    async fn publish(&self, task: &PublishTask) -> Result<PubOutcome> {
        let requests = container_requests(task)?;
        let containers = self
            .ctx
            .create_containers(self.api.as_ref(), task, &requests)
            .await?;

        info!(task_id = %task.id, containers = containers.len(), "Threads containers created");
        Ok(PubOutcome::Processing)
    }
}

/// Media of a task in display order: the video first, then the images
fn media(task: &PublishTask) -> Vec<(ContainerKind, &str)> {
    task.content
        .video_url
        .iter()
        .map(|url| (ContainerKind::Video, url.as_str()))
        .chain(task.content.image_urls.iter().map(|url| (ContainerKind::Image, url.as_str())))
        .collect()
}

fn container_requests(task: &PublishTask) -> Result<Vec<ContainerRequest>> {
    let text = task.content.post_message();
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(PlatformError::Validation(format!(
            "threads posts are limited to {} characters",
            MAX_TEXT_CHARS
        ))
        .into());
    }

    let media = media(task);
    match media.as_slice() {
        [] if text.is_empty() => Err(PlatformError::Validation("threads post has no text or media".to_string()).into()),
        [] => Ok(vec![ContainerRequest {
            kind: ContainerKind::Text,
            media_url: None,
            caption: Some(text),
            children: Vec::new(),
            is_carousel_item: false,
        }]),
        [(kind, url)] => Ok(vec![ContainerRequest::media(*kind, url).with_caption(text)]),
        many if many.len() > MAX_CAROUSEL_ITEMS => Err(PlatformError::Validation(format!(
            "threads carousels hold at most {} items",
            MAX_CAROUSEL_ITEMS
        ))
        .into()),
        many => Ok(many
            .iter()
            .map(|(kind, url)| ContainerRequest::media(*kind, url).carousel_item())
            .collect()),
    }
}

fn map_status(raw: &str) -> ContainerStatus {
    match raw.to_ascii_uppercase().as_str() {
        "FINISHED" | "PUBLISHED" => ContainerStatus::Finished,
        "ERROR" | "EXPIRED" => ContainerStatus::Failed,
        "CREATED" | "QUEUED" | "NOT_STARTED" => ContainerStatus::Created,
        _ => ContainerStatus::InProgress,
    }
}

#[async_trait]
impl Publisher for ThreadsPublisher {
    fn destination(&self) -> Destination {
        Destination::Threads
    }

    async fn check_auth(&self, account_id: &str) -> Result<AuthCheck> {
        self.ctx.check_auth(account_id, Destination::Threads).await
    }

    async fn do_pub(&self, task: &PublishTask) -> Result<PubOutcome> {
        match self.publish(task).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => PubOutcome::from_error(e),
        }
    }

    async fn find_existing(&self, task: &PublishTask) -> Result<Option<PublishedContent>> {
        self.ctx.find_published(self.api.as_ref(), task).await
    }

    async fn container_status(&self, task: &PublishTask, container: &MediaContainer) -> Result<ContainerStatus> {
        self.ctx
            .poll_container(self.api.as_ref(), task, container, map_status)
            .await
    }

    async fn finalize(&self, task: &PublishTask, containers: &[MediaContainer]) -> Result<PubOutcome> {
        let text = task.content.post_message();
        let result: Result<PublishedContent> = self
            .ctx
            .credentials
            .with_token(&task.account_id, Destination::Threads, |token| {
                let text = &text;
                async move {
                    let container_id = match containers {
                        [] => {
                            return Err(PlatformError::Validation("threads task has no containers".to_string()).into())
                        }
                        [single] => single.destination_container_id.clone(),
                        many => {
                            let carousel = ContainerRequest {
                                kind: ContainerKind::Carousel,
                                media_url: None,
                                caption: None,
                                children: many.iter().map(|c| c.destination_container_id.clone()).collect(),
                                is_carousel_item: false,
                            }
                            .with_caption(text.clone());
                            self.api.create_container(&token, &carousel).await?
                        }
                    };
                    self.api.publish_container(&token, &container_id).await
                }
            })
            .await;

        match result {
            Ok(content) => {
                info!(task_id = %task.id, post_id = %content.content_id, "Threads post published");
                Ok(PubOutcome::Published(content))
            }
            Err(e) => PubOutcome::from_error(e),
        }
    }
}

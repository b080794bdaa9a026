//! Facebook Page adapter
//!
//! Text and photo posts go straight to the page feed. Photos are uploaded
//! as unpublished media first and attached to the feed post. Videos, reels
//! and video stories are processed asynchronously and published by the
//! Media Pipeline. Image stories publish immediately.

use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;
use tracing::info;

use super::{PubOutcome, Publisher, PublisherContext};
use crate::api::{ContainerKind, ContainerRequest, PlatformApi, PostRequest, PostUpdate};
use crate::credentials::AuthCheck;
use crate::error::{OmnicastError, PlatformError, Result};
use crate::types::{
    ContainerStatus, ContentCategory, Destination, MediaContainer, PostEdit, PublishRecord, PublishTask,
    PublishedContent,
};

const MAX_PHOTOS: usize = 10;

pub struct FacebookPublisher {
    ctx: PublisherContext,
    api: Arc<dyn PlatformApi>,
}

impl FacebookPublisher {
    pub fn new(ctx: PublisherContext, api: Arc<dyn PlatformApi>) -> Self {
        Self { ctx, api }
    }

    async fn publish(&self, task: &PublishTask) -> Result<PubOutcome> {
        let content = &task.content;
        let category = task
            .options
            .facebook
            .as_ref()
            .and_then(|o| o.category)
            .unwrap_or(ContentCategory::Post);

        match (category, content.video_url.as_deref()) {
            (ContentCategory::Post, Some(url)) => {
                let request = ContainerRequest::media(ContainerKind::Video, url).with_caption(content.post_message());
                self.process_video(task, request).await
            }
            (ContentCategory::Reel, Some(url)) => {
                let request = ContainerRequest::media(ContainerKind::Reel, url).with_caption(content.post_message());
                self.process_video(task, request).await
            }
            (ContentCategory::Story, Some(url)) => {
                self.process_video(task, ContainerRequest::media(ContainerKind::Story, url))
                    .await
            }
            (ContentCategory::Reel, None) => {
                Err(PlatformError::Validation("facebook reels need a video".to_string()).into())
            }
            (ContentCategory::Story, None) => {
                let url = content
                    .image_urls
                    .first()
                    .ok_or_else(|| PlatformError::Validation("facebook stories need an image or a video".to_string()))?;
                let request = ContainerRequest::media(ContainerKind::Story, url);
                let published = self
                    .ctx
                    .credentials
                    .with_token(&task.account_id, Destination::Facebook, |token| {
                        let request = &request;
                        async move {
                            let container_id = self.api.create_container(&token, request).await?;
                            self.api.publish_container(&token, &container_id).await
                        }
                    })
                    .await?;
                info!(task_id = %task.id, story_id = %published.content_id, "Facebook story published");
                Ok(PubOutcome::Published(published))
            }
            (ContentCategory::Post, None) => {
                let published = self.post_to_feed(task).await?;
                info!(task_id = %task.id, post_id = %published.content_id, "Facebook post published");
                Ok(PubOutcome::Published(published))
            }
        }
    }

    async fn process_video(&self, task: &PublishTask, request: ContainerRequest) -> Result<PubOutcome> {
        self.ctx
            .create_containers(self.api.as_ref(), task, std::slice::from_ref(&request))
            .await?;
        info!(task_id = %task.id, "Facebook video uploaded, waiting for processing");
        Ok(PubOutcome::Processing)
    }

    async fn post_to_feed(&self, task: &PublishTask) -> Result<PublishedContent> {
        let content = &task.content;
        let text = content.post_message();
        if text.is_empty() && !content.has_images() {
            return Err(PlatformError::Validation("facebook post has no text or photos".to_string()).into());
        }
        if content.image_urls.len() > MAX_PHOTOS {
            return Err(PlatformError::Validation(format!(
                "facebook posts carry at most {} photos",
                MAX_PHOTOS
            ))
            .into());
        }

        self.ctx
            .credentials
            .with_token(&task.account_id, Destination::Facebook, |token| {
                let text = &text;
                async move {
                    let mut media_ids = Vec::new();
                    for url in &content.image_urls {
                        media_ids.push(self.upload_photo(&token, url).await?);
                    }
                    let request = PostRequest {
                        text: text.clone(),
                        media_ids,
                        link: None,
                        reference: task.id.clone(),
                    };
                    self.api.create_post(&token, &request).await
                }
            })
            .await
    }

    /// Unpublished photo to attach to a feed post
    async fn upload_photo(&self, token: &SecretString, url: &str) -> Result<String> {
        let request = ContainerRequest::media(ContainerKind::Image, url).carousel_item();
        self.api.create_container(token, &request).await
    }
}

fn map_status(raw: &str) -> ContainerStatus {
    match raw.to_ascii_lowercase().as_str() {
        "ready" | "published" | "finished" => ContainerStatus::Finished,
        "error" | "expired" => ContainerStatus::Failed,
        "created" | "queued" | "not_started" => ContainerStatus::Created,
        _ => ContainerStatus::InProgress,
    }
}

#[async_trait]
impl Publisher for FacebookPublisher {
    fn destination(&self) -> Destination {
        Destination::Facebook
    }

    async fn check_auth(&self, account_id: &str) -> Result<AuthCheck> {
        self.ctx.check_auth(account_id, Destination::Facebook).await
    }

    async fn do_pub(&self, task: &PublishTask) -> Result<PubOutcome> {
        match self.publish(task).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => PubOutcome::from_error(e),
        }
    }

    async fn find_existing(&self, task: &PublishTask) -> Result<Option<PublishedContent>> {
        if task.content.has_video() {
            return self.ctx.find_published(self.api.as_ref(), task).await;
        }
        if let Some(id) = &task.destination_content_id {
            return Ok(Some(PublishedContent::new(id.clone())));
        }
        self.ctx
            .credentials
            .with_token(&task.account_id, Destination::Facebook, |token| async move {
                self.api.find_post(&token, &task.id).await
            })
            .await
    }

    async fn container_status(&self, task: &PublishTask, container: &MediaContainer) -> Result<ContainerStatus> {
        self.ctx
            .poll_container(self.api.as_ref(), task, container, map_status)
            .await
    }

    async fn finalize(&self, task: &PublishTask, containers: &[MediaContainer]) -> Result<PubOutcome> {
        let container = match containers.first() {
            Some(container) => container,
            None => return Ok(PubOutcome::rejected("facebook task has no media containers")),
        };
        let container_id = container.destination_container_id.as_str();
        let result = self
            .ctx
            .credentials
            .with_token(&task.account_id, Destination::Facebook, |token| async move {
                self.api.publish_container(&token, container_id).await
            })
            .await;

        match result {
            Ok(content) => {
                info!(task_id = %task.id, video_id = %content.content_id, "Facebook video published");
                Ok(PubOutcome::Published(content))
            }
            Err(e) => PubOutcome::from_error(e),
        }
    }

    fn check_update(&self, record: &PublishRecord) -> Result<()> {
        if record.content.has_video() {
            return Err(OmnicastError::InvalidInput(
                "only facebook feed posts can be edited".to_string(),
            ));
        }
        Ok(())
    }

    async fn update_published(&self, record: &PublishRecord, edit: &PostEdit) -> Result<PubOutcome> {
        if let Err(e) = self.check_update(record) {
            return PubOutcome::from_error(e);
        }
        let content = edit.apply(&record.content);
        let text = content.post_message();
        if text.is_empty() && !content.has_images() {
            return Ok(PubOutcome::rejected("facebook post has no text or photos"));
        }

        let update = PostUpdate {
            text: Some(text),
            ..Default::default()
        };
        let result = self
            .ctx
            .credentials
            .with_token(&record.account_id, Destination::Facebook, |token| {
                let update = &update;
                async move {
                    self.api
                        .update_post(&token, &record.destination_content_id, update)
                        .await
                }
            })
            .await;

        match result {
            Ok(updated) => {
                info!(task_id = %record.task_id, post_id = %updated.content_id, "Facebook post edited");
                Ok(PubOutcome::Published(updated))
            }
            Err(e) => PubOutcome::from_error(e),
        }
    }

    fn permalink(&self, _destination_uid: &str, content_id: &str) -> Option<String> {
        Some(format!("https://www.facebook.com/{}", content_id))
    }
}

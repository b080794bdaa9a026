//! Twitter / X adapter
//!
//! Text and image posts are created synchronously. Images go through a
//! one-segment media upload each. Videos use the chunked INIT / APPEND /
//! FINALIZE upload and are then processed by Twitter; the media id is handed
//! to the Media Pipeline and the post is created once processing succeeds.
//!
//! Every post carries the task id as its client reference, so a retry can
//! find a post an earlier attempt created before its response was lost.

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::segmented::{Addressing, SegmentedUpload};
use super::{PubOutcome, Publisher, PublisherContext};
use crate::api::{mime_from_url, file_name_from_url, PlatformApi, PostMetadata, PostRequest, Segment, UploadInit};
use crate::credentials::AuthCheck;
use crate::error::{PlatformError, Result};
use crate::types::{ContainerStatus, Destination, MediaContainer, PublishTask, PublishedContent};

const MAX_TEXT_CHARS: usize = 280;
const MAX_IMAGES: usize = 4;

pub struct TwitterPublisher {
    ctx: PublisherContext,
    api: Arc<dyn PlatformApi>,
}

impl TwitterPublisher {
    pub fn new(ctx: PublisherContext, api: Arc<dyn PlatformApi>) -> Self {
        Self { ctx, api }
    }

    async fn publish(&self, task: &PublishTask) -> Result<PubOutcome> {
        let text = validate(task)?;

        if task.content.has_video() {
            if !self.ctx.existing_containers(task).await?.is_empty() {
                debug!(task_id = %task.id, "Video already uploaded, waiting for processing");
                return Ok(PubOutcome::Processing);
            }
            let media_id = self
                .ctx
                .credentials
                .with_token(&task.account_id, Destination::Twitter, |token| async move {
                    self.upload_video(&token, task).await
                })
                .await?;
            self.ctx.track_container(task, media_id, 0).await?;
            return Ok(PubOutcome::Processing);
        }

        let content = self
            .ctx
            .credentials
            .with_token(&task.account_id, Destination::Twitter, |token| {
                let text = &text;
                async move {
                    let mut media_ids = Vec::new();
                    for url in &task.content.image_urls {
                        media_ids.push(self.upload_image(&token, url).await?);
                    }
                    self.create_post(&token, task, text, media_ids).await
                }
            })
            .await?;

        info!(task_id = %task.id, post_id = %content.content_id, "Tweet posted");
        Ok(PubOutcome::Published(content))
    }

    async fn upload_video(&self, token: &SecretString, task: &PublishTask) -> Result<String> {
        let video_url = task
            .content
            .video_url
            .as_deref()
            .ok_or_else(|| PlatformError::Validation("twitter video task has no video".to_string()))?;

        let upload = SegmentedUpload::new(
            self.api.as_ref(),
            self.ctx.source.as_ref(),
            &self.ctx.db,
            Addressing::PartNumber,
            self.ctx.chunk_size,
        );
        let completed = upload
            .upload(token, task, video_url, json!({ "media_category": "tweet_video" }))
            .await?;
        let media = self
            .api
            .finalize_upload(token, &completed.session, &PostMetadata::default())
            .await?;

        info!(task_id = %task.id, media_id = %media.content_id, "Twitter video uploaded, processing");
        Ok(media.content_id)
    }

    /// Single-request upload of a small image; returns the media id
    async fn upload_image(&self, token: &SecretString, url: &str) -> Result<String> {
        let data: Bytes = self.ctx.source.fetch(url).await?;
        let total = data.len() as u64;
        if total == 0 {
            return Err(PlatformError::Validation(format!("image at {} is empty", url)).into());
        }

        let init = UploadInit {
            file_name: file_name_from_url(url),
            mime_type: mime_from_url(url).to_string(),
            total_size: total,
            chunk_size: total,
            total_chunks: 1,
            metadata: json!({ "media_category": "tweet_image" }),
        };
        let session = self.api.init_upload(token, &init).await?;
        let segment = Segment {
            index: 0,
            start: 0,
            end: total - 1,
            total,
        };
        self.api.transfer_segment(token, &session, &segment, data).await?;
        let media = self
            .api
            .finalize_upload(token, &session, &PostMetadata::default())
            .await?;
        Ok(media.content_id)
    }

    async fn create_post(
        &self,
        token: &SecretString,
        task: &PublishTask,
        text: &str,
        media_ids: Vec<String>,
    ) -> Result<PublishedContent> {
        let request = PostRequest {
            text: text.to_string(),
            media_ids,
            link: None,
            reference: task.id.clone(),
        };
        let content = self.api.create_post(token, &request).await?;
        Ok(self.with_permalink(task, content))
    }

    fn with_permalink(&self, task: &PublishTask, content: PublishedContent) -> PublishedContent {
        if content.permalink.is_some() {
            return content;
        }
        match self.permalink(&task.destination_uid, &content.content_id) {
            Some(permalink) => content.with_permalink(permalink),
            None => content,
        }
    }
}

fn validate(task: &PublishTask) -> Result<String> {
    let text = task.content.post_message();
    if text.is_empty() && !task.content.has_video() && !task.content.has_images() {
        return Err(PlatformError::Validation("tweet has no text or media".to_string()).into());
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(PlatformError::Validation(format!(
            "tweets are limited to {} characters",
            MAX_TEXT_CHARS
        ))
        .into());
    }
    if task.content.image_urls.len() > MAX_IMAGES {
        return Err(PlatformError::Validation(format!(
            "tweets carry at most {} images",
            MAX_IMAGES
        ))
        .into());
    }
    if task.content.has_video() && task.content.has_images() {
        return Err(PlatformError::Validation("tweets cannot mix video and images".to_string()).into());
    }
    Ok(text)
}

fn map_status(raw: &str) -> ContainerStatus {
    match raw.to_ascii_lowercase().as_str() {
        "succeeded" | "finished" => ContainerStatus::Finished,
        "failed" | "error" => ContainerStatus::Failed,
        "pending" => ContainerStatus::Created,
        _ => ContainerStatus::InProgress,
    }
}

#[async_trait]
impl Publisher for TwitterPublisher {
    fn destination(&self) -> Destination {
        Destination::Twitter
    }

    async fn check_auth(&self, account_id: &str) -> Result<AuthCheck> {
        self.ctx.check_auth(account_id, Destination::Twitter).await
    }

    async fn do_pub(&self, task: &PublishTask) -> Result<PubOutcome> {
        match self.publish(task).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => PubOutcome::from_error(e),
        }
    }

    async fn find_existing(&self, task: &PublishTask) -> Result<Option<PublishedContent>> {
        if let Some(id) = &task.destination_content_id {
            return Ok(Some(PublishedContent::new(id.clone())));
        }

        let found = self
            .ctx
            .credentials
            .with_token(&task.account_id, Destination::Twitter, |token| async move {
                self.api.find_post(&token, &task.id).await
            })
            .await?;
        Ok(found.map(|content| self.with_permalink(task, content)))
    }

    async fn container_status(&self, task: &PublishTask, container: &MediaContainer) -> Result<ContainerStatus> {
        self.ctx
            .poll_container(self.api.as_ref(), task, container, map_status)
            .await
    }

    async fn finalize(&self, task: &PublishTask, containers: &[MediaContainer]) -> Result<PubOutcome> {
        let text = task.content.post_message();
        let media_ids: Vec<String> = containers
            .iter()
            .map(|c| c.destination_container_id.clone())
            .collect();

        let result = self
            .ctx
            .credentials
            .with_token(&task.account_id, Destination::Twitter, |token| {
                let text = &text;
                let media_ids = media_ids.clone();
                async move { self.create_post(&token, task, text, media_ids).await }
            })
            .await;

        match result {
            Ok(content) => {
                info!(task_id = %task.id, post_id = %content.content_id, "Tweet with video posted");
                Ok(PubOutcome::Published(content))
            }
            Err(e) => PubOutcome::from_error(e),
        }
    }

    fn permalink(&self, destination_uid: &str, content_id: &str) -> Option<String> {
        Some(format!("https://x.com/{}/status/{}", destination_uid, content_id))
    }
}

//! YouTube adapter
//!
//! Uses the resumable upload protocol: the video resource (snippet and
//! status) is declared when the session opens, bytes are sent at explicit
//! offsets, and the response to the final byte carries the video id.

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use super::segmented::{Addressing, SegmentedUpload};
use super::{require_video, PubOutcome, Publisher, PublisherContext};
use crate::api::{PlatformApi, PostMetadata, PostUpdate};
use crate::credentials::AuthCheck;
use crate::error::{PlatformError, Result};
use crate::types::{
    ContentRefs, Destination, PostEdit, PublishRecord, PublishTask, PublishedContent, YoutubeOptions,
};

const MAX_TITLE_CHARS: usize = 100;
const DEFAULT_PRIVACY: &str = "public";
/// People & Blogs
const DEFAULT_CATEGORY: &str = "22";

pub struct YoutubePublisher {
    ctx: PublisherContext,
    api: Arc<dyn PlatformApi>,
}

impl YoutubePublisher {
    pub fn new(ctx: PublisherContext, api: Arc<dyn PlatformApi>) -> Self {
        Self { ctx, api }
    }

    async fn publish(&self, task: &PublishTask) -> Result<PubOutcome> {
        let video_url = require_video(task)?;
        let options = task.options.youtube.clone().unwrap_or_default();
        let resource = video_resource(&task.content, Some(&options))?;

        let content = self
            .ctx
            .credentials
            .with_token(&task.account_id, Destination::Youtube, |token| {
                let resource = &resource;
                async move { self.upload(&token, task, video_url, resource).await }
            })
            .await?;

        info!(task_id = %task.id, video_id = %content.content_id, "YouTube video uploaded");
        Ok(PubOutcome::Published(content))
    }

    async fn upload(
        &self,
        token: &SecretString,
        task: &PublishTask,
        video_url: &str,
        resource: &serde_json::Value,
    ) -> Result<PublishedContent> {
        let upload = SegmentedUpload::new(
            self.api.as_ref(),
            self.ctx.source.as_ref(),
            &self.ctx.db,
            Addressing::ByteOffset,
            self.ctx.chunk_size,
        );
        let completed = upload.upload(token, task, video_url, resource.clone()).await?;

        // The last segment normally answers with the video id; ask for it if
        // that response was lost
        let content = match completed.report.content_id {
            Some(video_id) => PublishedContent::new(video_id),
            None => {
                let metadata = PostMetadata {
                    title: task.content.title.clone(),
                    description: task.content.description.clone(),
                    tags: task.content.topics.clone(),
                    cover: None,
                    extra: resource.clone(),
                };
                self.api
                    .finalize_upload(token, &completed.session, &metadata)
                    .await?
            }
        };

        Ok(match self.permalink(&task.destination_uid, &content.content_id) {
            Some(permalink) => PublishedContent::new(content.content_id).with_permalink(permalink),
            None => content,
        })
    }

    async fn update_video(&self, record: &PublishRecord, edit: &PostEdit) -> Result<PublishedContent> {
        let content = edit.apply(&record.content);
        let resource = video_resource(&content, edit.youtube.as_ref())?;
        let update = PostUpdate {
            text: None,
            title: content.title.clone(),
            description: Some(content.post_message()),
            tags: content.topics.clone(),
            extra: resource,
        };

        let updated = self
            .ctx
            .credentials
            .with_token(&record.account_id, Destination::Youtube, |token| {
                let update = &update;
                async move {
                    self.api
                        .update_post(&token, &record.destination_content_id, update)
                        .await
                }
            })
            .await?;

        Ok(match self.permalink(&record.destination_uid, &updated.content_id) {
            Some(permalink) => PublishedContent::new(updated.content_id).with_permalink(permalink),
            None => updated,
        })
    }
}

/// The `snippet` part, plus the `status` part when options are given
///
/// Uploads always send both. Edits leave the status alone unless the edit
/// carries new options.
fn video_resource(content: &ContentRefs, options: Option<&YoutubeOptions>) -> Result<serde_json::Value> {
    let title = content
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| PlatformError::Validation("youtube videos need a title".to_string()))?;
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(PlatformError::Validation(format!(
            "youtube titles are limited to {} characters",
            MAX_TITLE_CHARS
        ))
        .into());
    }

    let category = options
        .and_then(|o| o.category_id.as_deref())
        .unwrap_or(DEFAULT_CATEGORY);
    let mut resource = json!({
        "snippet": {
            "title": title,
            "description": content.post_message(),
            "tags": content.topics,
            "categoryId": category,
        },
    });
    if let Some(options) = options {
        resource["status"] = json!({
            "privacyStatus": options.privacy_status.as_deref().unwrap_or(DEFAULT_PRIVACY),
            "selfDeclaredMadeForKids": options.made_for_kids,
        });
    }
    Ok(resource)
}

#[async_trait]
impl Publisher for YoutubePublisher {
    fn destination(&self) -> Destination {
        Destination::Youtube
    }

    async fn check_auth(&self, account_id: &str) -> Result<AuthCheck> {
        self.ctx.check_auth(account_id, Destination::Youtube).await
    }

    async fn do_pub(&self, task: &PublishTask) -> Result<PubOutcome> {
        match self.publish(task).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => PubOutcome::from_error(e),
        }
    }

    fn check_update(&self, _record: &PublishRecord) -> Result<()> {
        Ok(())
    }

    async fn update_published(&self, record: &PublishRecord, edit: &PostEdit) -> Result<PubOutcome> {
        match self.update_video(record, edit).await {
            Ok(content) => {
                info!(task_id = %record.task_id, video_id = %content.content_id, "YouTube video edited");
                Ok(PubOutcome::Published(content))
            }
            Err(e) => PubOutcome::from_error(e),
        }
    }

    fn permalink(&self, _destination_uid: &str, content_id: &str) -> Option<String> {
        Some(format!("https://www.youtube.com/watch?v={}", content_id))
    }
}

//! Bilibili adapter
//!
//! Video archives are uploaded in numbered parts, with the cover image sent
//! as a separate single-shot upload first. The archive is submitted when the
//! upload is finalized with its title, partition and copyright fields.

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::segmented::{Addressing, SegmentedUpload};
use super::{require_video, PubOutcome, Publisher, PublisherContext};
use crate::api::{mime_from_url, PlatformApi, PostMetadata};
use crate::credentials::AuthCheck;
use crate::error::{PlatformError, Result};
use crate::types::{BilibiliOptions, Destination, PublishTask, PublishedContent};

/// Archive titles are limited to 80 characters
const MAX_TITLE_CHARS: usize = 80;

pub struct BilibiliPublisher {
    ctx: PublisherContext,
    api: Arc<dyn PlatformApi>,
}

impl BilibiliPublisher {
    pub fn new(ctx: PublisherContext, api: Arc<dyn PlatformApi>) -> Self {
        Self { ctx, api }
    }

    async fn publish(&self, task: &PublishTask) -> Result<PubOutcome> {
        let video_url = require_video(task)?;
        let title = validate_title(task)?;
        let options = task.options.bilibili.clone().unwrap_or_default();
        validate_copyright(&options)?;

        let content = self
            .ctx
            .credentials
            .with_token(&task.account_id, Destination::Bilibili, |token| {
                let options = &options;
                async move { self.submit(&token, task, video_url, title, options).await }
            })
            .await?;

        info!(task_id = %task.id, archive = %content.content_id, "Bilibili archive submitted");
        Ok(PubOutcome::Published(content))
    }

    async fn submit(
        &self,
        token: &SecretString,
        task: &PublishTask,
        video_url: &str,
        title: &str,
        options: &BilibiliOptions,
    ) -> Result<PublishedContent> {
        let cover = match task.content.cover_url.as_deref() {
            Some(cover_url) => {
                let data = self.ctx.source.fetch(cover_url).await?;
                let cover = self.api.upload_cover(token, data, mime_from_url(cover_url)).await?;
                debug!(task_id = %task.id, cover = %cover, "Cover uploaded");
                Some(cover)
            }
            None => None,
        };

        let upload = SegmentedUpload::new(
            self.api.as_ref(),
            self.ctx.source.as_ref(),
            &self.ctx.db,
            Addressing::PartNumber,
            self.ctx.chunk_size,
        );
        let completed = upload
            .upload(token, task, video_url, json!({ "profile": "ugcupos/bup" }))
            .await?;

        let metadata = PostMetadata {
            title: Some(title.to_string()),
            description: task.content.description.clone(),
            tags: task.content.topics.clone(),
            cover,
            extra: json!({
                "tid": options.tid,
                "copyright": options.copyright.unwrap_or(1),
                "source": options.source,
                "no_reprint": options.no_reprint,
            }),
        };
        let content = self
            .api
            .finalize_upload(token, &completed.session, &metadata)
            .await?;

        if content.permalink.is_some() {
            return Ok(content);
        }
        Ok(match self.permalink(&task.destination_uid, &content.content_id) {
            Some(permalink) => content.with_permalink(permalink),
            None => content,
        })
    }
}

fn validate_title(task: &PublishTask) -> Result<&str> {
    let title = task
        .content
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| PlatformError::Validation("bilibili archives need a title".to_string()))?;

    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(PlatformError::Validation(format!(
            "bilibili titles are limited to {} characters",
            MAX_TITLE_CHARS
        ))
        .into());
    }
    Ok(title)
}

fn validate_copyright(options: &BilibiliOptions) -> Result<()> {
    match options.copyright {
        None | Some(1) => Ok(()),
        Some(2) if options.source.as_deref().map_or(false, |s| !s.trim().is_empty()) => Ok(()),
        Some(2) => Err(PlatformError::Validation("reposted archives must name their source".to_string()).into()),
        Some(other) => Err(PlatformError::Validation(format!("unknown copyright flag {}", other)).into()),
    }
}

#[async_trait]
impl Publisher for BilibiliPublisher {
    fn destination(&self) -> Destination {
        Destination::Bilibili
    }

    async fn check_auth(&self, account_id: &str) -> Result<AuthCheck> {
        self.ctx.check_auth(account_id, Destination::Bilibili).await
    }

    async fn do_pub(&self, task: &PublishTask) -> Result<PubOutcome> {
        match self.publish(task).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => PubOutcome::from_error(e),
        }
    }

    fn permalink(&self, _destination_uid: &str, content_id: &str) -> Option<String> {
        Some(format!("https://www.bilibili.com/video/{}", content_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::ops;
    use crate::publishers::test_support::{harness, stored_task, video};

    fn publisher(harness: &crate::publishers::test_support::Harness) -> BilibiliPublisher {
        BilibiliPublisher::new(harness.ctx.clone(), Arc::new(harness.api.clone()))
    }

    #[tokio::test]
    async fn test_uploads_cover_then_parts_then_finalizes() {
        let harness = harness(Destination::Bilibili).await;
        let mut content = video("https://cdn.example/clip.mp4");
        content.cover_url = Some("https://cdn.example/cover.jpg".to_string());
        let task = stored_task(&harness, Destination::Bilibili, content).await;

        let outcome = publisher(&harness).do_pub(&task).await.unwrap();

        let content = match outcome {
            PubOutcome::Published(content) => content,
            other => panic!("expected a published archive, got {:?}", other),
        };
        assert_eq!(
            content.permalink.as_deref(),
            Some("https://www.bilibili.com/video/bilibili-content-bilibili-session-1")
        );
        assert_eq!(harness.api.calls(ops::UPLOAD_COVER), 1);
        assert_eq!(harness.api.received_segments().len(), 3);

        let finalized = harness.api.finalized_uploads();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].title.as_deref(), Some("Launch"));
        assert_eq!(finalized[0].cover.as_deref(), Some("bilibili-cover-16"));
        assert_eq!(finalized[0].extra["copyright"], 1);
    }

    #[tokio::test]
    async fn test_missing_title_is_rejected_without_upload() {
        let harness = harness(Destination::Bilibili).await;
        let mut content = video("https://cdn.example/clip.mp4");
        content.title = None;
        let task = stored_task(&harness, Destination::Bilibili, content).await;

        let outcome = publisher(&harness).do_pub(&task).await.unwrap();
        assert!(matches!(outcome, PubOutcome::Failed { no_retry: true, .. }));
        assert_eq!(harness.api.calls(ops::INIT_UPLOAD), 0);
    }

    #[tokio::test]
    async fn test_repost_without_source_is_rejected() {
        let harness = harness(Destination::Bilibili).await;
        let mut task = stored_task(&harness, Destination::Bilibili, video("https://cdn.example/clip.mp4")).await;
        task.options.bilibili = Some(BilibiliOptions {
            copyright: Some(2),
            ..Default::default()
        });

        let outcome = publisher(&harness).do_pub(&task).await.unwrap();
        assert!(matches!(outcome, PubOutcome::Failed { no_retry: true, .. }));
    }

    #[tokio::test]
    async fn test_transient_finalize_failure_is_retryable() {
        let harness = harness(Destination::Bilibili).await;
        harness
            .api
            .fail_next(ops::FINALIZE_UPLOAD, PlatformError::Timeout("gateway".to_string()));
        let task = stored_task(&harness, Destination::Bilibili, video("https://cdn.example/clip.mp4")).await;

        let outcome = publisher(&harness).do_pub(&task).await.unwrap();
        assert!(matches!(outcome, PubOutcome::Failed { no_retry: false, .. }));
    }
}

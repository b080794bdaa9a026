//! TikTok adapter
//!
//! Videos are sent with the file-upload source: the publish is initialized
//! with the post info and chunk layout, then each chunk is PUT to the upload
//! URL. TikTok finishes processing on its own and reports the result through
//! the `post.publish.*` webhooks, so a successful `do_pub` only means the
//! video was submitted.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::segmented::{Addressing, SegmentedUpload};
use super::{require_video, PubOutcome, Publisher, PublisherContext};
use crate::api::PlatformApi;
use crate::completion::{WebhookEvent, WebhookKind};
use crate::credentials::AuthCheck;
use crate::error::{OmnicastError, Result};
use crate::types::{Destination, PublishTask, PublishedContent, TiktokOptions};

const DEFAULT_PRIVACY: &str = "PUBLIC_TO_EVERYONE";

pub struct TiktokPublisher {
    ctx: PublisherContext,
    api: Arc<dyn PlatformApi>,
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    event: String,
    /// JSON document encoded as a string
    content: String,
}

#[derive(Debug, Deserialize)]
struct WebhookContent {
    publish_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    post_id: Option<serde_json::Value>,
}

impl TiktokPublisher {
    pub fn new(ctx: PublisherContext, api: Arc<dyn PlatformApi>) -> Self {
        Self { ctx, api }
    }

    async fn publish(&self, task: &PublishTask) -> Result<PubOutcome> {
        let video_url = require_video(task)?;
        let post_info = post_info(task);

        let publish_id = self
            .ctx
            .credentials
            .with_token(&task.account_id, Destination::Tiktok, |token| {
                let post_info = &post_info;
                async move {
                    let upload = SegmentedUpload::new(
                        self.api.as_ref(),
                        self.ctx.source.as_ref(),
                        &self.ctx.db,
                        Addressing::PartNumber,
                        self.ctx.chunk_size,
                    );
                    let completed = upload
                        .upload(
                            &token,
                            task,
                            video_url,
                            json!({ "post_info": post_info, "source_info": { "source": "FILE_UPLOAD" } }),
                        )
                        .await?;
                    Ok::<_, OmnicastError>(completed.session.session_id)
                }
            })
            .await?;

        info!(task_id = %task.id, publish_id = %publish_id, "TikTok video submitted, waiting for webhook");
        Ok(PubOutcome::Submitted(PublishedContent::new(publish_id)))
    }
}

fn post_info(task: &PublishTask) -> serde_json::Value {
    let options: TiktokOptions = task.options.tiktok.clone().unwrap_or_default();
    let title = task
        .content
        .title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| task.content.post_message());

    json!({
        "title": title,
        "privacy_level": options.privacy_level.as_deref().unwrap_or(DEFAULT_PRIVACY),
        "disable_comment": options.disable_comment,
        "disable_duet": options.disable_duet,
        "disable_stitch": options.disable_stitch,
    })
}

#[async_trait]
impl Publisher for TiktokPublisher {
    fn destination(&self) -> Destination {
        Destination::Tiktok
    }

    async fn check_auth(&self, account_id: &str) -> Result<AuthCheck> {
        self.ctx.check_auth(account_id, Destination::Tiktok).await
    }

    async fn do_pub(&self, task: &PublishTask) -> Result<PubOutcome> {
        match self.publish(task).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => PubOutcome::from_error(e),
        }
    }

    fn parse_webhook(&self, body: &str) -> Result<Option<WebhookEvent>> {
        let body: WebhookBody = serde_json::from_str(body)
            .map_err(|e| OmnicastError::InvalidInput(format!("tiktok webhook: {}", e)))?;
        if !body.event.starts_with("post.publish") {
            warn!(event = %body.event, "Ignoring unknown TikTok webhook event");
            return Ok(None);
        }

        let content: WebhookContent = serde_json::from_str(&body.content)
            .map_err(|e| OmnicastError::InvalidInput(format!("tiktok webhook content: {}", e)))?;
        let publish_id = content
            .publish_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OmnicastError::InvalidInput("tiktok webhook has no publish_id".to_string()))?;

        let kind = match body.event.as_str() {
            "post.publish.complete" | "post.publish.inbox_delivered" => WebhookKind::Published,
            "post.publish.publicly_available" => WebhookKind::PubliclyAvailable {
                post_id: content.post_id.map(|id| match id {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                }),
            },
            "post.publish.failed" => WebhookKind::Failed {
                reason: content.reason.unwrap_or_else(|| "publish failed".to_string()),
            },
            other => {
                warn!(event = %other, "Ignoring unknown TikTok publish event");
                return Ok(None);
            }
        };

        Ok(Some(WebhookEvent {
            destination: Destination::Tiktok,
            content_id: publish_id,
            kind,
        }))
    }

    fn permalink(&self, destination_uid: &str, content_id: &str) -> Option<String> {
        Some(format!("https://www.tiktok.com/@{}/video/{}", destination_uid, content_id))
    }
}

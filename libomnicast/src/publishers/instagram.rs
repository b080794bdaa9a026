//! Instagram adapter
//!
//! Instagram publishes through media containers: one container per image or
//! video is created from its public URL, Instagram fetches and processes it,
//! and the container (or a carousel built from several) is published once
//! processing finishes. `do_pub` only creates containers; the Media Pipeline
//! polls them and calls [`Publisher::finalize`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{PubOutcome, Publisher, PublisherContext};
use crate::api::{ContainerKind, ContainerRequest, PlatformApi};
use crate::credentials::AuthCheck;
use crate::error::{PlatformError, Result};
use crate::types::{ContainerStatus, ContentCategory, Destination, MediaContainer, PublishTask, PublishedContent};

const MAX_CAROUSEL_ITEMS: usize = 10;
const MAX_CAPTION_CHARS: usize = 2200;

pub struct InstagramPublisher {
    ctx: PublisherContext,
    api: Arc<dyn PlatformApi>,
}

impl InstagramPublisher {
    pub fn new(ctx: PublisherContext, api: Arc<dyn PlatformApi>) -> Self {
        Self { ctx, api }
    }

    async fn publish(&self, task: &PublishTask) -> Result<PubOutcome> {
        let requests = container_requests(task)?;
        let containers = self
            .ctx
            .create_containers(self.api.as_ref(), task, &requests)
            .await?;

        info!(
            task_id = %task.id,
            containers = containers.len(),
            "Instagram containers created, waiting for processing"
        );
        Ok(PubOutcome::Processing)
    }

    async fn publish_containers(&self, task: &PublishTask, containers: &[MediaContainer]) -> Result<PublishedContent> {
        let caption = caption(task);
        self.ctx
            .credentials
            .with_token(&task.account_id, Destination::Instagram, |token| {
                let caption = &caption;
                async move {
                    let container_id = match containers {
                        [single] => single.destination_container_id.clone(),
                        many => {
                            let carousel = ContainerRequest {
                                kind: ContainerKind::Carousel,
                                media_url: None,
                                caption: None,
                                children: many.iter().map(|c| c.destination_container_id.clone()).collect(),
                                is_carousel_item: false,
                            }
                            .with_caption(caption.clone());
                            self.api.create_container(&token, &carousel).await?
                        }
                    };
                    self.api.publish_container(&token, &container_id).await
                }
            })
            .await
    }
}

/// The category a task publishes as: explicit option, else reel for video, else feed post
fn category(task: &PublishTask) -> ContentCategory {
    match task.options.instagram.as_ref().and_then(|o| o.category) {
        Some(category) => category,
        None if task.content.has_video() && !task.content.has_images() => ContentCategory::Reel,
        None => ContentCategory::Post,
    }
}

fn caption(task: &PublishTask) -> String {
    task.content.post_message()
}

fn container_requests(task: &PublishTask) -> Result<Vec<ContainerRequest>> {
    let caption = caption(task);
    if caption.chars().count() > MAX_CAPTION_CHARS {
        return Err(PlatformError::Validation(format!(
            "instagram captions are limited to {} characters",
            MAX_CAPTION_CHARS
        ))
        .into());
    }

    let content = &task.content;
    match category(task) {
        ContentCategory::Post => {
            if !content.has_images() {
                return match content.video_url.as_deref() {
                    Some(url) => Ok(vec![ContainerRequest::media(ContainerKind::Reel, url).with_caption(caption)]),
                    None => Err(PlatformError::Validation("instagram posts need an image or a video".to_string()).into()),
                };
            }
            if content.image_urls.len() > MAX_CAROUSEL_ITEMS {
                return Err(PlatformError::Validation(format!(
                    "instagram carousels hold at most {} items",
                    MAX_CAROUSEL_ITEMS
                ))
                .into());
            }
            match content.image_urls.as_slice() {
                [single] => Ok(vec![ContainerRequest::media(ContainerKind::Image, single).with_caption(caption)]),
                many => Ok(many
                    .iter()
                    .map(|url| ContainerRequest::media(ContainerKind::Image, url).carousel_item())
                    .collect()),
            }
        }
        ContentCategory::Reel => {
            let url = content
                .video_url
                .as_deref()
                .ok_or_else(|| PlatformError::Validation("instagram reels need a video".to_string()))?;
            Ok(vec![ContainerRequest::media(ContainerKind::Reel, url).with_caption(caption)])
        }
        ContentCategory::Story => {
            let url = content
                .video_url
                .as_deref()
                .or_else(|| content.image_urls.first().map(String::as_str))
                .ok_or_else(|| PlatformError::Validation("instagram stories need an image or a video".to_string()))?;
            Ok(vec![ContainerRequest::media(ContainerKind::Story, url)])
        }
    }
}

fn map_status(raw: &str) -> ContainerStatus {
    match raw.to_ascii_uppercase().as_str() {
        "FINISHED" | "PUBLISHED" => ContainerStatus::Finished,
        "ERROR" | "EXPIRED" | "FAILED" => ContainerStatus::Failed,
        "CREATED" | "QUEUED" | "NOT_STARTED" => ContainerStatus::Created,
        _ => ContainerStatus::InProgress,
    }
}

#[async_trait]
impl Publisher for InstagramPublisher {
    fn destination(&self) -> Destination {
        Destination::Instagram
    }

    async fn check_auth(&self, account_id: &str) -> Result<AuthCheck> {
        self.ctx.check_auth(account_id, Destination::Instagram).await
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
        if containers.is_empty() {
            return Ok(PubOutcome::rejected("instagram task has no media containers"));
        }
        match self.publish_containers(task, containers).await {
            Ok(content) => {
                info!(task_id = %task.id, media_id = %content.content_id, "Instagram media published");
                Ok(PubOutcome::Published(content))
            }
            Err(e) => PubOutcome::from_error(e),
        }
    }

    fn permalink(&self, _destination_uid: &str, content_id: &str) -> Option<String> {
        Some(format!("https://www.instagram.com/p/{}/", content_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::ops;
    use crate::publishers::test_support::{harness, images, stored_task, video, Harness};
    use crate::types::MetaOptions;

    fn publisher(harness: &Harness) -> InstagramPublisher {
        InstagramPublisher::new(harness.ctx.clone(), Arc::new(harness.api.clone()))
    }

    #[tokio::test]
    async fn test_single_image_post() {
        let harness = harness(Destination::Instagram).await;
        let task = stored_task(&harness, Destination::Instagram, images(&["https://cdn.example/a.jpg"])).await;
        let publisher = publisher(&harness);

        assert_eq!(publisher.do_pub(&task).await.unwrap(), PubOutcome::Processing);

        let created = harness.api.created_containers();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].kind, ContainerKind::Image);
        assert_eq!(created[0].caption.as_deref(), Some("Gallery"));

        let containers = harness.ctx.existing_containers(&task).await.unwrap();
        let outcome = publisher.finalize(&task, &containers).await.unwrap();
        assert_eq!(
            outcome,
            PubOutcome::Published(
                PublishedContent::new("media-container-1")
                    .with_permalink("https://instagram.example/p/container-1")
            )
        );
    }

    #[tokio::test]
    async fn test_multiple_images_become_a_carousel() {
        let harness = harness(Destination::Instagram).await;
        let task = stored_task(
            &harness,
            Destination::Instagram,
            images(&["https://cdn.example/a.jpg", "https://cdn.example/b.jpg", "https://cdn.example/c.jpg"]),
        )
        .await;
        let publisher = publisher(&harness);

        publisher.do_pub(&task).await.unwrap();
        let containers = harness.ctx.existing_containers(&task).await.unwrap();
        assert_eq!(containers.len(), 3);
        assert!(harness.api.created_containers().iter().all(|c| c.is_carousel_item));

        publisher.finalize(&task, &containers).await.unwrap();

        let created = harness.api.created_containers();
        let carousel = &created[3];
        assert_eq!(carousel.kind, ContainerKind::Carousel);
        assert_eq!(carousel.children, vec!["container-1", "container-2", "container-3"]);
        assert_eq!(carousel.caption.as_deref(), Some("Gallery"));
        assert_eq!(harness.api.published_containers(), vec!["container-4".to_string()]);
    }

    #[tokio::test]
    async fn test_interrupted_creation_resumes_at_missing_container() {
        let harness = harness(Destination::Instagram).await;
        harness
            .api
            .fail_next(ops::CREATE_CONTAINER, PlatformError::Network("reset".to_string()));
        let task = stored_task(
            &harness,
            Destination::Instagram,
            images(&["https://cdn.example/a.jpg", "https://cdn.example/b.jpg"]),
        )
        .await;
        let publisher = publisher(&harness);

        // First container creation fails before anything is tracked
        let outcome = publisher.do_pub(&task).await.unwrap();
        assert!(matches!(outcome, PubOutcome::Failed { no_retry: false, .. }));

        assert_eq!(publisher.do_pub(&task).await.unwrap(), PubOutcome::Processing);
        assert_eq!(publisher.do_pub(&task).await.unwrap(), PubOutcome::Processing);
        assert_eq!(harness.api.created_containers().len(), 2);
        assert_eq!(harness.ctx.existing_containers(&task).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_video_defaults_to_reel_and_story_has_no_caption() {
        let harness = harness(Destination::Instagram).await;
        let reel = stored_task(&harness, Destination::Instagram, video("https://cdn.example/clip.mp4")).await;
        publisher(&harness).do_pub(&reel).await.unwrap();

        let mut story = stored_task(&harness, Destination::Instagram, images(&["https://cdn.example/a.jpg"])).await;
        story.options.instagram = Some(MetaOptions {
            category: Some(ContentCategory::Story),
        });
        publisher(&harness).do_pub(&story).await.unwrap();

        let created = harness.api.created_containers();
        assert_eq!(created[0].kind, ContainerKind::Reel);
        assert!(created[0].caption.is_some());
        assert_eq!(created[1].kind, ContainerKind::Story);
        assert_eq!(created[1].caption, None);
    }

    #[tokio::test]
    async fn test_text_only_post_is_rejected() {
        let harness = harness(Destination::Instagram).await;
        let mut content = images(&[]);
        content.description = Some("words only".to_string());
        let task = stored_task(&harness, Destination::Instagram, content).await;

        let outcome = publisher(&harness).do_pub(&task).await.unwrap();
        assert!(matches!(outcome, PubOutcome::Failed { no_retry: true, .. }));
        assert_eq!(harness.api.calls(ops::CREATE_CONTAINER), 0);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status("FINISHED"), ContainerStatus::Finished);
        assert_eq!(map_status("IN_PROGRESS"), ContainerStatus::InProgress);
        assert_eq!(map_status("ERROR"), ContainerStatus::Failed);
        assert_eq!(map_status("EXPIRED"), ContainerStatus::Failed);
        assert_eq!(map_status("CREATED"), ContainerStatus::Created);
        assert_eq!(map_status("queued"), ContainerStatus::Created);
        assert_eq!(map_status("something new"), ContainerStatus::InProgress);
    }

    #[tokio::test]
    async fn test_find_existing_after_lost_publish_response() {
        let harness = harness(Destination::Instagram).await;
        let task = stored_task(
            &harness,
            Destination::Instagram,
            images(&["https://cdn.example/a.jpg", "https://cdn.example/b.jpg"]),
        )
        .await;
        let publisher = publisher(&harness);

        publisher.do_pub(&task).await.unwrap();
        assert!(publisher.find_existing(&task).await.unwrap().is_none());

        harness.api.lose_next_response(ops::PUBLISH_CONTAINER);
        let containers = harness.ctx.existing_containers(&task).await.unwrap();
        let outcome = publisher.finalize(&task, &containers).await.unwrap();
        assert!(matches!(outcome, PubOutcome::Failed { no_retry: false, .. }));

        // The carousel was published even though the answer never arrived
        let existing = publisher.find_existing(&task).await.unwrap();
        assert_eq!(existing.map(|c| c.content_id), Some("media-container-3".to_string()));
        assert_eq!(harness.api.calls(ops::FIND_PUBLISHED), 2);
    }
}

//! End-to-end publish flows through the service, the queues and mock destinations

mod common;

use common::{images, setup, text, video, OWNER};
use libomnicast::api::mock::ops;
use libomnicast::error::PlatformError;
use libomnicast::events::Event;
use libomnicast::queue::{EnqueueOutcome, JobState};
use libomnicast::types::RecordStatus;
use libomnicast::{Destination, TaskStatus};

#[tokio::test]
async fn test_segmented_video_upload_is_published() {
    let mut env = setup(&[Destination::Youtube]).await;
    let task = env.create(Destination::Youtube, video("https://cdn.example/launch.mp4"), 0).await;

    env.drain().await;

    // 12 MiB in 5 MiB chunks: two full segments and a partial one
    let segments = env.api(Destination::Youtube).received_segments();
    assert_eq!(segments.len(), 3);
    assert_eq!(segments[0].bytes, 5 * 1024 * 1024);
    assert_eq!(segments[2].bytes, 2 * 1024 * 1024);

    assert!(env.service.get_task(&task.id).await.unwrap().is_none());
    let records = env.db().records_for_task(&task.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RecordStatus::Published);

    let events = env.events();
    assert!(matches!(&events[..], [Event::TaskPublished { task_id, .. }] if *task_id == task.id));
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let mut env = setup(&[Destination::Twitter]).await;
    env.api(Destination::Twitter)
        .fail_next(ops::CREATE_POST, PlatformError::Network("connection reset".to_string()))
        .fail_next(ops::CREATE_POST, PlatformError::Network("connection reset".to_string()));

    let task = env.create(Destination::Twitter, text("Shipping today"), 0).await;
    env.drain().await;

    assert_eq!(env.api(Destination::Twitter).calls(ops::CREATE_POST), 3);
    assert!(env.service.get_task(&task.id).await.unwrap().is_none());
    let records = env.db().records_for_task(&task.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].destination_content_id, "post-1");
    assert_eq!(env.events().len(), 1);
}

#[tokio::test]
async fn test_attempt_cap_fails_task_once() {
    let mut env = setup(&[Destination::Twitter]).await;
    for _ in 0..3 {
        env.api(Destination::Twitter)
            .fail_next(ops::CREATE_POST, PlatformError::Timeout("gateway".to_string()));
    }

    let task = env.create(Destination::Twitter, text("Shipping today"), 0).await;
    env.drain().await;
    env.drain().await;

    assert_eq!(env.api(Destination::Twitter).calls(ops::CREATE_POST), 3);
    let stored = env.service.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Fail);
    assert_eq!(stored.error_message.as_deref(), Some("Request timed out: gateway"));

    let job = env.service.dispatch().job(&stored).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);

    let failures: Vec<Event> = env
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::TaskFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
}

#[tokio::test]
async fn test_rejected_content_is_not_retried() {
    let env = setup(&[Destination::Twitter]).await;
    env.api(Destination::Twitter)
        .fail_next(ops::CREATE_POST, PlatformError::Rejected("duplicate content".to_string()));

    let task = env.create(Destination::Twitter, text("Shipping today"), 0).await;
    env.drain().await;

    assert_eq!(env.api(Destination::Twitter).calls(ops::CREATE_POST), 1);
    let stored = env.service.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Fail);
    assert!(stored.error_message.unwrap().contains("duplicate content"));
}

#[tokio::test]
async fn test_enqueue_is_idempotent_per_task() {
    let env = setup(&[Destination::Twitter]).await;
    let task = env.create(Destination::Twitter, text("Shipping soon"), 60).await;

    let again = env.service.dispatch().enqueue(&task).await.unwrap();
    assert_eq!(again, EnqueueOutcome::AlreadyQueued(JobState::Delayed));

    let stats = env.service.stats().await.unwrap();
    assert_eq!(stats.publish_queue.delayed, 1);
    assert_eq!(stats.publish_queue.waiting, 0);
}

#[tokio::test]
async fn test_carousel_waits_for_every_container() {
    let env = setup(&[Destination::Instagram]).await;
    let api = env.api(Destination::Instagram);
    api.script_status("container-2", &["IN_PROGRESS", "FINISHED"]);

    let task = env
        .create(
            Destination::Instagram,
            images(&["https://cdn.example/1.jpg", "https://cdn.example/2.jpg", "https://cdn.example/3.jpg"]),
            0,
        )
        .await;
    env.drain().await;

    // First poll checks all three, the second only the one still processing
    assert_eq!(api.calls(ops::CONTAINER_STATUS), 4);
    assert_eq!(api.published_containers(), vec!["container-4".to_string()]);

    let records = env.db().records_for_task(&task.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].destination_content_id, "media-container-4");
    assert!(env.db().containers_for_task(&task.id).await.unwrap().len() >= 3);
}

#[tokio::test]
async fn test_failed_container_halts_task() {
    let mut env = setup(&[Destination::Instagram]).await;
    let api = env.api(Destination::Instagram);
    api.script_status("container-3", &["ERROR"]);

    let task = env
        .create(
            Destination::Instagram,
            images(&["https://cdn.example/1.jpg", "https://cdn.example/2.jpg", "https://cdn.example/3.jpg"]),
            0,
        )
        .await;
    env.drain().await;

    assert!(api.published_containers().is_empty());
    let stored = env.service.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Fail);

    let events = env.events();
    assert!(matches!(&events[..], [Event::TaskFailed { .. }]));
}

#[tokio::test]
async fn test_webhook_completes_submitted_video() {
    let mut env = setup(&[Destination::Tiktok]).await;
    let task = env.create(Destination::Tiktok, video("https://cdn.example/clip.mp4"), 0).await;
    env.drain().await;

    let stored = env.service.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Publishing);
    assert!(env.events().is_empty());

    let body = serde_json::json!({
        "event": "post.publish.publicly_available",
        "content": serde_json::json!({ "publish_id": "tiktok-session-1", "post_id": "7301" }).to_string(),
    })
    .to_string();
    let record = env
        .service
        .handle_webhook(Destination::Tiktok, &body)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.status, RecordStatus::Published);
    assert_eq!(
        record.permalink.as_deref(),
        Some("https://www.tiktok.com/@creator/video/7301")
    );
    assert!(env.service.get_task(&task.id).await.unwrap().is_none());

    // Replayed delivery is absorbed
    env.service.handle_webhook(Destination::Tiktok, &body).await.unwrap();
    assert_eq!(env.events().len(), 1);
}

#[tokio::test]
async fn test_cancelled_task_is_never_published() {
    let env = setup(&[Destination::Twitter]).await;
    let task = env.create(Destination::Twitter, text("Never mind"), 30).await;

    assert!(env.service.cancel_task(&task.id, OWNER).await.unwrap());
    env.service.scheduler().sweep().await.unwrap();
    env.drain().await;

    assert_eq!(env.api(Destination::Twitter).calls(ops::CREATE_POST), 0);
    assert!(env.db().records_for_task(&task.id).await.unwrap().is_empty());
}

//! Credential refresh and schedule handling across the service

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{account_id, setup, text, OWNER};
use libomnicast::api::mock::{ops, MockApi};
use libomnicast::api::TokenGrant;
use libomnicast::credentials::{AuthStatus, CredentialCache};
use libomnicast::error::{OmnicastError, PlatformError};
use libomnicast::queue::JobState;
use libomnicast::service::PublishNow;
use libomnicast::{Database, Destination, TaskStatus};
use secrecy::ExposeSecret;
use tempfile::TempDir;

async fn cache_with(grant_lifetime: i64) -> (CredentialCache, MockApi, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("credentials.db");
    let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
    let api = MockApi::new("youtube");

    let cache = CredentialCache::new(db, Duration::from_secs(600))
        .with_token_api(Destination::Youtube, Arc::new(api.clone()));
    cache
        .store_grant(
            "acc-1",
            Destination::Youtube,
            TokenGrant {
                access_token: "stale".to_string(),
                refresh_token: Some("refresh".to_string()),
                expires_in: grant_lifetime,
                refresh_expires_in: None,
            },
        )
        .await
        .unwrap();
    (cache, api, temp_dir)
}

#[tokio::test]
async fn test_token_inside_margin_is_refreshed_once() {
    // Five minutes left against a ten minute margin
    let (cache, api, _dir) = cache_with(300).await;

    let first = cache.get_valid_token("acc-1", Destination::Youtube).await.unwrap();
    let second = cache.get_valid_token("acc-1", Destination::Youtube).await.unwrap();

    assert_eq!(first.expose_secret(), "youtube-access-1");
    assert_eq!(second.expose_secret(), first.expose_secret());
    assert_eq!(api.calls(ops::REFRESH), 1);
}

#[tokio::test]
async fn test_token_outside_margin_is_served_from_cache() {
    let (cache, api, _dir) = cache_with(3600).await;

    let token = cache.get_valid_token("acc-1", Destination::Youtube).await.unwrap();

    assert_eq!(token.expose_secret(), "stale");
    assert_eq!(api.calls(ops::REFRESH), 0);
}

#[tokio::test]
async fn test_failed_refresh_surfaces_auth_expired() {
    let (cache, api, _dir) = cache_with(60).await;
    api.fail_next(ops::REFRESH, PlatformError::Authentication("invalid_grant".to_string()));

    let result = cache.get_valid_token("acc-1", Destination::Youtube).await;
    assert!(matches!(
        result,
        Err(OmnicastError::Platform(PlatformError::AuthExpired { .. }))
    ));
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_and_publish_succeeds() {
    let env = setup(&[Destination::Twitter]).await;
    env.api(Destination::Twitter).reject_token("twitter-token");

    let task = env.create(Destination::Twitter, text("Hello again"), 0).await;
    env.drain().await;

    assert_eq!(env.api(Destination::Twitter).calls(ops::REFRESH), 1);
    assert!(env.service.get_task(&task.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_revoked_account_fails_without_publishing() {
    let env = setup(&[Destination::Twitter]).await;
    env.credentials
        .revoke(&account_id(Destination::Twitter), Destination::Twitter)
        .await
        .unwrap();

    let check = env
        .service
        .check_account_auth(&account_id(Destination::Twitter))
        .await
        .unwrap();
    assert_eq!(check.status, AuthStatus::Expired);

    let task = env.create(Destination::Twitter, text("Hello"), 0).await;
    env.drain().await;

    let stored = env.service.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Fail);
    assert!(stored.error_message.unwrap().contains("re-authorized"));
    assert_eq!(env.api(Destination::Twitter).calls(ops::CREATE_POST), 0);
}

#[tokio::test]
async fn test_task_one_minute_out_is_enqueued_at_creation() {
    let env = setup(&[Destination::Twitter]).await;
    let task = env.create(Destination::Twitter, text("Soon"), 60).await;

    let job = env.service.dispatch().job(&task).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);

    // The sweep finds the same job rather than adding one
    let report = env.service.scheduler().sweep().await.unwrap();
    assert_eq!(report.enqueued, 0);
    assert_eq!(report.duplicates, 1);
}

#[tokio::test]
async fn test_sweep_picks_up_rescheduled_task() {
    let env = setup(&[Destination::Twitter]).await;
    let task = env.create(Destination::Twitter, text("Later"), 6 * 3600).await;
    assert!(env.service.dispatch().job(&task).await.unwrap().is_none());

    let report = env.service.scheduler().sweep().await.unwrap();
    assert_eq!(report.found, 0);

    let soon = chrono::Utc::now().timestamp() + 300;
    assert!(env.service.reschedule_task(&task.id, soon, OWNER).await.unwrap());
    assert!(env.service.dispatch().job(&task).await.unwrap().is_none());

    // Past the immediate threshold, inside a wider sweep window
    let mut config = env.service.config().clone();
    config.scheduler.window_secs = 600;
    let scheduler = libomnicast::scheduler::Scheduler::new(
        env.db().clone(),
        env.service.dispatch().clone(),
        env.service.pipeline(),
        &config.scheduler,
        &config.queue,
    );
    let report = scheduler.sweep().await.unwrap();
    assert_eq!(report.enqueued, 1);
}

#[tokio::test]
async fn test_publish_now_runs_future_task() {
    let env = setup(&[Destination::Twitter]).await;
    let task = env.create(Destination::Twitter, text("Right away"), 6 * 3600).await;

    assert_eq!(env.service.publish_now(&task.id).await.unwrap(), PublishNow::Enqueued);
    env.drain().await;

    assert_eq!(env.api(Destination::Twitter).calls(ops::CREATE_POST), 1);
    assert!(env.service.get_task(&task.id).await.unwrap().is_none());
}

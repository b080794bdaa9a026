//! Shared setup for integration tests
//!
//! Builds a `PublishingService` whose destinations are served by `MockApi`
//! instances, with backoff and poll delays set to zero so `WorkerPool::drain`
//! can run a whole retry or polling sequence in one call.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use libomnicast::accounts::StaticAccounts;
use libomnicast::api::mock::MockApi;
use libomnicast::api::TokenGrant;
use libomnicast::credentials::CredentialCache;
use libomnicast::events::{Event, EventBus, EventReceiver};
use libomnicast::pipeline::MediaPipeline;
use libomnicast::publishers::{create_publisher, PublisherContext, PublisherRegistry};
use libomnicast::service::{CreateTaskRequest, PublishingService};
use libomnicast::types::{Account, ContentRefs, DestinationOptions};
use libomnicast::{Config, Database, Destination, PublishTask};
use tempfile::TempDir;

pub const OWNER: &str = "user-1";

pub struct TestEnv {
    pub service: PublishingService,
    pub credentials: Arc<CredentialCache>,
    pub events: EventReceiver,
    pub _temp_dir: TempDir,
    mocks: Vec<(Destination, MockApi)>,
}

impl TestEnv {
    pub fn api(&self, destination: Destination) -> &MockApi {
        self.mocks
            .iter()
            .find(|(d, _)| *d == destination)
            .map(|(_, api)| api)
            .expect("destination not set up")
    }

    pub fn db(&self) -> &Database {
        self.service.db()
    }

    /// Create a task for the account on `destination`, due `offset_secs` from now
    pub async fn create(&self, destination: Destination, content: ContentRefs, offset_secs: i64) -> PublishTask {
        self.service
            .create_publish_task(CreateTaskRequest {
                account_id: account_id(destination),
                destination,
                content,
                scheduled_at: chrono::Utc::now().timestamp() + offset_secs,
                options: DestinationOptions::default(),
            })
            .await
            .unwrap()
    }

    /// Run publish workers then media workers until both queues have nothing due
    pub async fn drain(&self) {
        let publish = self.service.publish_workers();
        let media = self.service.media_workers();
        loop {
            let processed = publish.drain().await.unwrap() + media.drain().await.unwrap();
            if processed == 0 {
                break;
            }
        }
    }

    pub fn events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn account_id(destination: Destination) -> String {
    format!("acc-{}", destination)
}

pub fn test_config(db_path: &str) -> Config {
    let mut config = Config::default_config();
    config.database.path = db_path.to_string();
    config.queue.backoff_base_secs = 0;
    config.media.poll_delay_secs = 0;
    config.media.retry_delay_secs = 0;
    config
}

/// A service with one authorized account per destination, on an on-disk store
pub async fn setup(destinations: &[Destination]) -> TestEnv {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("omnicast.db");
    let config = test_config(db_path.to_str().unwrap());
    let db = Database::new(&config.database.path).await.unwrap();

    let mocks: Vec<(Destination, MockApi)> = destinations
        .iter()
        .map(|d| (*d, MockApi::new(d.as_str())))
        .collect();

    let mut credentials = CredentialCache::new(db.clone(), Duration::from_secs(config.credentials.refresh_margin_secs));
    for (destination, api) in &mocks {
        credentials = credentials.with_token_api(*destination, Arc::new(api.clone()));
    }
    let credentials = Arc::new(credentials);

    let accounts = StaticAccounts::new();
    let mut publishers = PublisherRegistry::new();
    for (destination, api) in &mocks {
        accounts
            .register(Account {
                id: account_id(*destination),
                owner_id: OWNER.to_string(),
                destination: *destination,
                destination_uid: "creator".to_string(),
            })
            .unwrap();
        credentials
            .store_grant(
                &account_id(*destination),
                *destination,
                TokenGrant {
                    access_token: format!("{}-token", destination),
                    refresh_token: Some(format!("{}-refresh", destination)),
                    expires_in: 3600,
                    refresh_expires_in: None,
                },
            )
            .await
            .unwrap();

        let ctx = PublisherContext {
            db: db.clone(),
            credentials: credentials.clone(),
            source: Arc::new(api.clone()),
            chunk_size: config.transfer.chunk_size_bytes,
        };
        publishers.register(create_publisher(*destination, ctx, Arc::new(api.clone())));
    }

    let bus = EventBus::new(64);
    let events = bus.subscribe();
    let pipeline = MediaPipeline::new(db.clone(), &config.media).with_poll_delay(Duration::ZERO);
    let service = PublishingService::new(db, config, Arc::new(accounts), publishers, bus).with_pipeline(pipeline);

    TestEnv {
        service,
        credentials,
        events,
        _temp_dir: temp_dir,
        mocks,
    }
}

pub fn text(body: &str) -> ContentRefs {
    ContentRefs {
        description: Some(body.to_string()),
        ..Default::default()
    }
}

pub fn video(url: &str) -> ContentRefs {
    ContentRefs {
        video_url: Some(url.to_string()),
        title: Some("Launch".to_string()),
        description: Some("Our launch video".to_string()),
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

//! Publish events and their side-effect consumers
//!
//! Completion emits events onto an in-process bus built on
//! `tokio::sync::broadcast`. Side effects (activity counters, reward grants)
//! subscribe to the bus and run on their own tasks, so a failing consumer
//! never affects the task that published.
//!
//! ```no_run
//! use libomnicast::events::{Event, EventBus};
//!
//! # async fn example() {
//! let bus = EventBus::new(100);
//! let mut receiver = bus.subscribe();
//!
//! bus.emit(Event::TaskFailed {
//!     task_id: "abc".to_string(),
//!     owner_id: "user-1".to_string(),
//!     destination: libomnicast::Destination::Youtube,
//!     message: "video is required".to_string(),
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::types::Destination;

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskPublished {
        task_id: String,
        owner_id: String,
        account_id: String,
        destination: Destination,
        destination_content_id: String,
        permalink: Option<String>,
        published_at: i64,
    },
    TaskFailed {
        task_id: String,
        owner_id: String,
        destination: Destination,
        message: String,
    },
}

/// Multi-subscriber event bus. Emitting never blocks; events are dropped
/// when nobody is subscribed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means there are no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Consumers that react to published tasks
pub struct SideEffects {
    db: Database,
    points_per_publish: i64,
}

impl SideEffects {
    pub fn new(db: Database, points_per_publish: i64) -> Self {
        Self {
            db,
            points_per_publish,
        }
    }

    /// Subscribe to `bus` and process events until every sender is dropped
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let mut receiver = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => self.apply(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Side-effect consumer lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Side-effect consumer stopped");
        })
    }

    /// Apply one event. Failures are logged and swallowed.
    pub async fn apply(&self, event: &Event) {
        match event {
            Event::TaskPublished {
                task_id,
                owner_id,
                destination,
                published_at,
                ..
            } => {
                match self
                    .db
                    .record_daily_activity(owner_id, *destination, *published_at)
                    .await
                {
                    Ok(count) => debug!(owner_id = %owner_id, destination = %destination, count, "Activity recorded"),
                    Err(e) => warn!(task_id = %task_id, error = %e, "Failed to record daily activity"),
                }

                if self.points_per_publish > 0 {
                    match self
                        .db
                        .grant_reward(task_id, owner_id, self.points_per_publish)
                        .await
                    {
                        Ok(true) => info!(task_id = %task_id, owner_id = %owner_id, points = self.points_per_publish, "Reward granted"),
                        Ok(false) => debug!(task_id = %task_id, "Reward already granted"),
                        Err(e) => warn!(task_id = %task_id, error = %e, "Failed to grant reward"),
                    }
                }
            }
            Event::TaskFailed {
                task_id, message, ..
            } => {
                debug!(task_id = %task_id, message = %message, "Task failure observed");
            }
        }
    }
}

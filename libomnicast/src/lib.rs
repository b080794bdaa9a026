//! Omnicast - publish orchestration for multi-destination content distribution
//!
//! This library drives content through each destination's upload and publish
//! protocol (single-shot, segmented, or asynchronously processed) behind one
//! scheduling, retry and idempotency contract, and tracks every task to a
//! publish record or a terminal failure.

pub mod accounts;
pub mod api;
pub mod completion;
pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod publishers;
pub mod queue;
pub mod scheduler;
pub mod scheduling;
pub mod service;
pub mod types;
pub mod update;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use db::{Database, TaskFilter};
pub use error::{OmnicastError, Result};
pub use service::PublishingService;
pub use types::{ContentRefs, Destination, PublishRecord, PublishTask, TaskStatus};

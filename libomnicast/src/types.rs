//! Core types for Omnicast

use std::fmt;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OmnicastError;

/// A third-party publishing destination
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Bilibili,
    Youtube,
    Tiktok,
    Twitter,
    Instagram,
    Threads,
    Facebook,
}

impl Destination {
    pub const ALL: [Destination; 7] = [
        Destination::Bilibili,
        Destination::Youtube,
        Destination::Tiktok,
        Destination::Twitter,
        Destination::Instagram,
        Destination::Threads,
        Destination::Facebook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Bilibili => "bilibili",
            Destination::Youtube => "youtube",
            Destination::Tiktok => "tiktok",
            Destination::Twitter => "twitter",
            Destination::Instagram => "instagram",
            Destination::Threads => "threads",
            Destination::Facebook => "facebook",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Destination {
    type Err = OmnicastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bilibili" => Ok(Destination::Bilibili),
            "youtube" => Ok(Destination::Youtube),
            "tiktok" => Ok(Destination::Tiktok),
            "twitter" | "x" => Ok(Destination::Twitter),
            "instagram" => Ok(Destination::Instagram),
            "threads" => Ok(Destination::Threads),
            "facebook" => Ok(Destination::Facebook),
            other => Err(OmnicastError::InvalidInput(format!(
                "Unknown destination: {}",
                other
            ))),
        }
    }
}

/// Lifecycle of a Task Record
///
/// `Published` and `Fail` are terminal. A published task is deleted once its
/// Publish Record is written, so `Published` is only briefly observable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Publishing,
    PubLoading,
    Published,
    Fail,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Publishing => "publishing",
            TaskStatus::PubLoading => "pub_loading",
            TaskStatus::Published => "published",
            TaskStatus::Fail => "fail",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Published | TaskStatus::Fail)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = OmnicastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "publishing" => Ok(TaskStatus::Publishing),
            "pub_loading" => Ok(TaskStatus::PubLoading),
            "published" => Ok(TaskStatus::Published),
            "fail" => Ok(TaskStatus::Fail),
            other => Err(OmnicastError::InvalidInput(format!(
                "Unknown task status: {}",
                other
            ))),
        }
    }
}

/// Content references carried by a task. Media is referenced by URL, never embedded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContentRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
}

impl ContentRefs {
    pub fn has_video(&self) -> bool {
        self.video_url.is_some()
    }

    pub fn has_images(&self) -> bool {
        !self.image_urls.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.video_url.is_none()
            && self.image_urls.is_empty()
            && self.title.as_deref().map_or(true, |t| t.trim().is_empty())
            && self.description.as_deref().map_or(true, |d| d.trim().is_empty())
    }

    /// Text body for destinations that publish a single message: the
    /// description (or title when there is none) followed by the topics as
    /// hashtags.
    pub fn post_message(&self) -> String {
        let body = self
            .description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .or(self.title.as_deref())
            .unwrap_or("")
            .trim()
            .to_string();

        let tags: Vec<String> = self
            .topics
            .iter()
            .map(|t| t.trim().trim_start_matches('#'))
            .filter(|t| !t.is_empty())
            .map(|t| format!("#{}", t))
            .filter(|tag| !body.contains(tag.as_str()))
            .collect();

        match (body.is_empty(), tags.is_empty()) {
            (_, true) => body,
            (true, false) => tags.join(" "),
            (false, false) => format!("{}\n\n{}", body, tags.join(" ")),
        }
    }
}

/// Kind of post for destinations that distinguish feed posts from short video and stories
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    Post,
    Reel,
    Story,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BilibiliOptions {
    /// Partition (category) id
    #[serde(default)]
    pub tid: Option<u32>,
    /// 1 = original work, 2 = repost
    #[serde(default)]
    pub copyright: Option<u8>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub no_reprint: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct YoutubeOptions {
    #[serde(default)]
    pub privacy_status: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub made_for_kids: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TiktokOptions {
    #[serde(default)]
    pub privacy_level: Option<String>,
    #[serde(default)]
    pub disable_comment: bool,
    #[serde(default)]
    pub disable_duet: bool,
    #[serde(default)]
    pub disable_stitch: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetaOptions {
    #[serde(default)]
    pub category: Option<ContentCategory>,
}

/// Per-destination publish options
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DestinationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bilibili: Option<BilibiliOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube: Option<YoutubeOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiktok: Option<TiktokOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instagram: Option<MetaOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facebook: Option<MetaOptions>,
}

/// Durable Task Record: one intent to publish content to one account on one destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishTask {
    pub id: String,
    pub owner_id: String,
    pub account_id: String,
    pub destination: Destination,
    pub destination_uid: String,
    pub content: ContentRefs,
    pub options: DestinationOptions,
    pub scheduled_at: i64,
    pub status: TaskStatus,
    /// Idempotency key for the dispatch queue, `publish:{destination}:{uuid}`
    pub queue_job_id: String,
    pub error_message: Option<String>,
    pub destination_content_id: Option<String>,
    /// Serialized resumable upload session, if a segmented transfer was started
    pub upload_session: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PublishTask {
    pub fn new(account: &Account, content: ContentRefs, scheduled_at: i64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: account.owner_id.clone(),
            account_id: account.id.clone(),
            destination: account.destination,
            destination_uid: account.destination_uid.clone(),
            content,
            options: DestinationOptions::default(),
            scheduled_at,
            status: TaskStatus::Waiting,
            queue_job_id: format!("publish:{}:{}", account.destination, Uuid::new_v4()),
            error_message: None,
            destination_content_id: None,
            upload_session: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Accepted by the destination, completion arrives via webhook
    Publishing,
    Published,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Publishing => "publishing",
            RecordStatus::Published => "published",
            RecordStatus::Failed => "failed",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = OmnicastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publishing" => Ok(RecordStatus::Publishing),
            "published" => Ok(RecordStatus::Published),
            "failed" => Ok(RecordStatus::Failed),
            other => Err(OmnicastError::InvalidInput(format!(
                "Unknown record status: {}",
                other
            ))),
        }
    }
}

/// Content reference returned by a destination after a successful publish
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishedContent {
    pub content_id: String,
    #[serde(default)]
    pub permalink: Option<String>,
}

impl PublishedContent {
    pub fn new(content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            permalink: None,
        }
    }

    pub fn with_permalink(mut self, permalink: impl Into<String>) -> Self {
        self.permalink = Some(permalink.into());
        self
    }
}

/// Append-only history entry, created when a task completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRecord {
    pub id: Option<i64>,
    pub task_id: String,
    pub owner_id: String,
    pub account_id: String,
    pub destination: Destination,
    pub destination_uid: String,
    pub content: ContentRefs,
    pub queue_job_id: String,
    pub destination_content_id: String,
    pub permalink: Option<String>,
    pub status: RecordStatus,
    pub error_message: Option<String>,
    pub published_at: i64,
}

impl PublishRecord {
    pub fn from_task(task: &PublishTask, content: &PublishedContent, status: RecordStatus) -> Self {
        Self {
            id: None,
            task_id: task.id.clone(),
            owner_id: task.owner_id.clone(),
            account_id: task.account_id.clone(),
            destination: task.destination,
            destination_uid: task.destination_uid.clone(),
            content: task.content.clone(),
            queue_job_id: task.queue_job_id.clone(),
            destination_content_id: content.content_id.clone(),
            permalink: content.permalink.clone(),
            status,
            error_message: None,
            published_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Changes to the text and metadata of a published post. Absent fields keep
/// their published value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PostEdit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub youtube: Option<YoutubeOptions>,
}

impl PostEdit {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.topics.is_none() && self.youtube.is_none()
    }

    /// The published content with this edit applied
    pub fn apply(&self, content: &ContentRefs) -> ContentRefs {
        let mut edited = content.clone();
        if let Some(title) = &self.title {
            edited.title = Some(title.clone());
        }
        if let Some(description) = &self.description {
            edited.description = Some(description.clone());
        }
        if let Some(topics) = &self.topics {
            edited.topics = topics.clone();
        }
        edited
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EditStatus {
    Pending,
    Applied,
    Failed,
}

impl EditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditStatus::Pending => "pending",
            EditStatus::Applied => "applied",
            EditStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EditStatus {
    type Err = OmnicastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EditStatus::Pending),
            "applied" => Ok(EditStatus::Applied),
            "failed" => Ok(EditStatus::Failed),
            other => Err(OmnicastError::InvalidInput(format!("Unknown edit status: {}", other))),
        }
    }
}

/// Latest requested edit of a published post, one per task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostEditRecord {
    pub task_id: String,
    pub owner_id: String,
    pub edit: PostEdit,
    pub status: EditStatus,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Destination-side processing state of an uploaded media container
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    InProgress,
    Finished,
    Failed,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::InProgress => "in_progress",
            ContainerStatus::Finished => "finished",
            ContainerStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerStatus::Finished | ContainerStatus::Failed)
    }
}

impl FromStr for ContainerStatus {
    type Err = OmnicastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ContainerStatus::Created),
            "in_progress" => Ok(ContainerStatus::InProgress),
            "finished" => Ok(ContainerStatus::Finished),
            "failed" => Ok(ContainerStatus::Failed),
            other => Err(OmnicastError::InvalidInput(format!(
                "Unknown container status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaContainer {
    pub id: String,
    pub task_id: String,
    pub destination: Destination,
    pub destination_container_id: String,
    pub position: i64,
    pub status: ContainerStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MediaContainer {
    pub fn new(task: &PublishTask, destination_container_id: String, position: i64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            destination: task.destination,
            destination_container_id,
            position,
            status: ContainerStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Stored OAuth credential for one account on one destination
///
/// `expires_at` is the real expiry reported by the destination; the refresh
/// margin is applied when the token is read, not when it is stored.
#[derive(Debug)]
pub struct Credential {
    pub account_id: String,
    pub destination: Destination,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: i64,
    pub refresh_expires_at: Option<i64>,
    pub updated_at: i64,
}

impl Credential {
    /// Seconds until the access token expires (negative when already expired)
    pub fn remaining_secs(&self, now: i64) -> i64 {
        self.expires_at - now
    }

    /// Whether the refresh token can still be used at `now`
    pub fn can_refresh(&self, now: i64) -> bool {
        self.refresh_token.is_some() && self.refresh_expires_at.map_or(true, |at| at > now)
    }

    pub fn access_token(&self) -> SecretString {
        SecretString::from(self.access_token.expose_secret().to_string())
    }
}

/// A destination account owned by a user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub owner_id: String,
    pub destination: Destination,
    #[serde(default)]
    pub destination_uid: String,
}

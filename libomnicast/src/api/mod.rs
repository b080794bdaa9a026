//! Platform API Client capabilities
//!
//! Destination adapters never speak HTTP themselves. They are written against
//! the capability traits in this module, which cover the request shapes the
//! destinations share:
//!
//! - [`TokenApi`]: refresh an OAuth access token
//! - [`SegmentedUploadApi`]: chunked/resumable media transfer
//! - [`ContainerApi`]: create media containers, read their processing status, publish them
//! - [`PostApi`]: create a plain post and look one up by client reference
//! - [`MediaSource`]: read the source media by URL, whole or by byte range
//!
//! [`PlatformApi`] bundles the four destination-facing traits.
//!
//! [`gateway::GatewayClient`] implements them over HTTP; [`mock::MockApi`]
//! implements them in memory for tests.

pub mod gateway;
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::PublishedContent;

/// Result of a token exchange or refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_expires_in: Option<i64>,
}

#[async_trait]
pub trait TokenApi: Send + Sync {
    async fn refresh_token(&self, refresh_token: &SecretString) -> Result<TokenGrant>;
}

/// Parameters for opening an upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadInit {
    pub file_name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    /// Destination-specific fields (post info, media category, snippet)
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Handle for an open upload session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    #[serde(default)]
    pub upload_url: Option<String>,
}

/// One contiguous byte range of the source media. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for a `Content-Range` header
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }

    /// 1-based part number for destinations that number their chunks
    pub fn part_number(&self) -> u32 {
        self.index + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SegmentAck {
    /// More bytes are expected, starting at `next_offset`
    Continue { next_offset: u64 },
    /// The destination has the whole file
    Complete {
        #[serde(default)]
        content_id: Option<String>,
    },
}

/// Publish metadata sent when an upload is finalized
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Reference returned by a cover upload
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[async_trait]
pub trait SegmentedUploadApi: Send + Sync {
    async fn init_upload(&self, token: &SecretString, init: &UploadInit) -> Result<UploadSession>;

    async fn transfer_segment(
        &self,
        token: &SecretString,
        session: &UploadSession,
        segment: &Segment,
        data: Bytes,
    ) -> Result<SegmentAck>;

    /// Bytes the destination has durably received for this session
    async fn acknowledged_offset(&self, token: &SecretString, session: &UploadSession) -> Result<u64>;

    async fn finalize_upload(
        &self,
        token: &SecretString,
        session: &UploadSession,
        metadata: &PostMetadata,
    ) -> Result<PublishedContent>;

    /// Upload a cover image in one request, returning the destination's reference to it
    async fn upload_cover(&self, token: &SecretString, data: Bytes, mime_type: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    Image,
    Video,
    Reel,
    Story,
    Carousel,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRequest {
    pub kind: ContainerKind,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    /// Child container ids, for carousels
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub is_carousel_item: bool,
}

impl ContainerRequest {
    pub fn media(kind: ContainerKind, media_url: &str) -> Self {
        Self {
            kind,
            media_url: Some(media_url.to_string()),
            caption: None,
            children: Vec::new(),
            is_carousel_item: false,
        }
    }

    pub fn with_caption(mut self, caption: String) -> Self {
        if !caption.is_empty() {
            self.caption = Some(caption);
        }
        self
    }

    pub fn carousel_item(mut self) -> Self {
        self.is_carousel_item = true;
        self
    }
}

#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// Returns the destination's container id
    async fn create_container(&self, token: &SecretString, request: &ContainerRequest) -> Result<String>;

    /// Raw processing status in the destination's own vocabulary
    async fn container_status(&self, token: &SecretString, container_id: &str) -> Result<String>;

    async fn publish_container(&self, token: &SecretString, container_id: &str) -> Result<PublishedContent>;

    /// Media already published from this container, directly or as a carousel child
    async fn find_published(&self, token: &SecretString, container_id: &str) -> Result<Option<PublishedContent>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRequest {
    pub text: String,
    #[serde(default)]
    pub media_ids: Vec<String>,
    #[serde(default)]
    pub link: Option<String>,
    /// Client reference used to find the post again after an ambiguous failure
    pub reference: String,
}

/// New text and metadata for an already published post
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PostUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[async_trait]
pub trait PostApi: Send + Sync {
    async fn create_post(&self, token: &SecretString, request: &PostRequest) -> Result<PublishedContent>;

    async fn find_post(&self, token: &SecretString, reference: &str) -> Result<Option<PublishedContent>>;

    /// Replace the text and metadata of an existing post
    async fn update_post(
        &self,
        token: &SecretString,
        content_id: &str,
        update: &PostUpdate,
    ) -> Result<PublishedContent>;
}

/// Every destination-facing capability at once. Adapters hold one of these.
pub trait PlatformApi: TokenApi + SegmentedUploadApi + ContainerApi + PostApi {}

impl<T> PlatformApi for T where T: TokenApi + SegmentedUploadApi + ContainerApi + PostApi {}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn content_length(&self, url: &str) -> Result<u64>;

    /// Bytes `start..=end` of the media at `url`
    async fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes>;

    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Guess a MIME type from a media URL's extension
pub fn mime_from_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp4" | "m4v" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Last path component of a media URL, for upload file names
pub fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("media")
        .to_string()
}

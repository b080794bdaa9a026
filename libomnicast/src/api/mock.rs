//! In-memory implementation of every API capability
//!
//! `MockApi` stands in for a destination gateway and a media host at the same
//! time. Failures can be scripted per operation, container status sequences
//! can be scripted per container, and every call is counted so tests can
//! assert on exactly what an adapter sent.
//!
//! Clones share state, so a test can keep a handle while adapters own theirs.

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    ContainerApi, ContainerRequest, MediaSource, PostApi, PostMetadata, PostRequest, PostUpdate,
    Segment, SegmentAck, SegmentedUploadApi, TokenApi, TokenGrant, UploadInit, UploadSession,
};
use crate::error::{PlatformError, Result};
use crate::types::PublishedContent;

/// Operation names accepted by [`MockApi::fail_next`] and [`MockApi::calls`]
pub mod ops {
    pub const REFRESH: &str = "refresh_token";
    pub const INIT_UPLOAD: &str = "init_upload";
    pub const TRANSFER_SEGMENT: &str = "transfer_segment";
    pub const ACKNOWLEDGED_OFFSET: &str = "acknowledged_offset";
    pub const FINALIZE_UPLOAD: &str = "finalize_upload";
    pub const UPLOAD_COVER: &str = "upload_cover";
    pub const CREATE_CONTAINER: &str = "create_container";
    pub const CONTAINER_STATUS: &str = "container_status";
    pub const PUBLISH_CONTAINER: &str = "publish_container";
    pub const CREATE_POST: &str = "create_post";
    pub const FIND_POST: &str = "find_post";
    pub const FIND_PUBLISHED: &str = "find_published";
    pub const UPDATE_POST: &str = "update_post";
    pub const CONTENT_LENGTH: &str = "content_length";
    pub const FETCH_RANGE: &str = "fetch_range";
    pub const FETCH: &str = "fetch";
}

/// A segment the mock accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedSegment {
    pub session_id: String,
    pub segment: Segment,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct MockState {
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<PlatformError>>,
    refresh_grants: usize,
    token_lifetime_secs: i64,
    rejected_tokens: HashSet<String>,
    media_length: u64,
    sessions: usize,
    received: Vec<ReceivedSegment>,
    offsets: HashMap<String, u64>,
    lost_responses: HashMap<&'static str, usize>,
    uploads_finalized: Vec<PostMetadata>,
    containers: Vec<ContainerRequest>,
    status_scripts: HashMap<String, VecDeque<String>>,
    default_status: String,
    published_containers: Vec<String>,
    published_by_container: HashMap<String, PublishedContent>,
    posts: Vec<PostRequest>,
    posts_by_reference: HashMap<String, PublishedContent>,
    updates: Vec<(String, PostUpdate)>,
}

impl MockState {
    /// Whether the response to this call should be dropped after the work is done
    fn take_lost(&mut self, op: &'static str) -> bool {
        match self.lost_responses.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct MockApi {
    name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockApi {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(MockState {
                token_lifetime_secs: 3600,
                media_length: 12 * 1024 * 1024,
                default_status: "FINISHED".to_string(),
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count a call and pop a scripted failure for it, if any
    fn enter(&self, op: &'static str) -> Result<()> {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        match state.failures.get_mut(op).and_then(|queue| queue.pop_front()) {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn check_token(&self, token: &SecretString) -> Result<()> {
        if self.lock().rejected_tokens.contains(token.expose_secret()) {
            return Err(PlatformError::Authentication(format!(
                "{}: access token revoked",
                self.name
            ))
            .into());
        }
        Ok(())
    }

    /// Make the next call to `op` fail with `error`. Calls queue up.
    pub fn fail_next(&self, op: &'static str, error: PlatformError) -> &Self {
        self.lock().failures.entry(op).or_default().push_back(error);
        self
    }

    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Answer 401 for requests made with this access token
    pub fn reject_token(&self, token: &str) {
        self.lock().rejected_tokens.insert(token.to_string());
    }

    pub fn set_media_length(&self, bytes: u64) {
        self.lock().media_length = bytes;
    }

    /// The next `n` segment transfers are stored but answered with a network error
    pub fn lose_next_acks(&self, n: usize) {
        self.lock().lost_responses.insert(ops::TRANSFER_SEGMENT, n);
    }

    /// The next call to `op` takes effect but is answered with a network error.
    /// Honored by `publish_container` and `create_post`.
    pub fn lose_next_response(&self, op: &'static str) {
        *self.lock().lost_responses.entry(op).or_insert(0) += 1;
    }

    pub fn received_segments(&self) -> Vec<ReceivedSegment> {
        self.lock().received.clone()
    }

    pub fn finalized_uploads(&self) -> Vec<PostMetadata> {
        self.lock().uploads_finalized.clone()
    }

    pub fn created_containers(&self) -> Vec<ContainerRequest> {
        self.lock().containers.clone()
    }

    pub fn published_containers(&self) -> Vec<String> {
        self.lock().published_containers.clone()
    }

    pub fn created_posts(&self) -> Vec<PostRequest> {
        self.lock().posts.clone()
    }

    /// Edits received through `update_post`, as (content id, update)
    pub fn updates(&self) -> Vec<(String, PostUpdate)> {
        self.lock().updates.clone()
    }

    /// Statuses returned by successive polls of `container_id`; the last
    /// one repeats. Containers are numbered `container-1`, `container-2`, ...
    pub fn script_status(&self, container_id: &str, statuses: &[&str]) {
        self.lock().status_scripts.insert(
            container_id.to_string(),
            statuses.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Status returned for containers without a script
    pub fn set_default_status(&self, status: &str) {
        self.lock().default_status = status.to_string();
    }

    /// Pretend a post with this client reference already exists
    pub fn seed_post(&self, reference: &str, content: PublishedContent) {
        self.lock()
            .posts_by_reference
            .insert(reference.to_string(), content);
    }
}

#[async_trait]
impl TokenApi for MockApi {
    async fn refresh_token(&self, _refresh_token: &SecretString) -> Result<TokenGrant> {
        self.enter(ops::REFRESH)?;
        let mut state = self.lock();
        state.refresh_grants += 1;
        Ok(TokenGrant {
            access_token: format!("{}-access-{}", self.name, state.refresh_grants),
            refresh_token: Some(format!("{}-refresh-{}", self.name, state.refresh_grants)),
            expires_in: state.token_lifetime_secs,
            refresh_expires_in: None,
        })
    }
}

#[async_trait]
impl SegmentedUploadApi for MockApi {
    async fn init_upload(&self, token: &SecretString, _init: &UploadInit) -> Result<UploadSession> {
        self.enter(ops::INIT_UPLOAD)?;
        self.check_token(token)?;
        let mut state = self.lock();
        state.sessions += 1;
        let session_id = format!("{}-session-{}", self.name, state.sessions);
        state.offsets.insert(session_id.clone(), 0);
        Ok(UploadSession {
            upload_url: Some(format!("mock://{}/upload/{}", self.name, session_id)),
            session_id,
        })
    }

    async fn transfer_segment(
        &self,
        token: &SecretString,
        session: &UploadSession,
        segment: &Segment,
        data: Bytes,
    ) -> Result<SegmentAck> {
        self.enter(ops::TRANSFER_SEGMENT)?;
        self.check_token(token)?;
        if data.len() as u64 != segment.len() {
            return Err(PlatformError::Validation(format!(
                "segment {} declared {} bytes but carried {}",
                segment.index,
                segment.len(),
                data.len()
            ))
            .into());
        }

        let mut state = self.lock();
        state.received.push(ReceivedSegment {
            session_id: session.session_id.clone(),
            segment: *segment,
            bytes: data.len() as u64,
        });
        let offset = state.offsets.entry(session.session_id.clone()).or_insert(0);
        *offset = (*offset).max(segment.end + 1);
        let next_offset = *offset;

        if state.take_lost(ops::TRANSFER_SEGMENT) {
            return Err(lost_response());
        }

        if next_offset >= segment.total {
            Ok(SegmentAck::Complete {
                content_id: Some(format!("{}-upload-{}", self.name, session.session_id)),
            })
        } else {
            Ok(SegmentAck::Continue { next_offset })
        }
    }

    async fn acknowledged_offset(&self, token: &SecretString, session: &UploadSession) -> Result<u64> {
        self.enter(ops::ACKNOWLEDGED_OFFSET)?;
        self.check_token(token)?;
        Ok(self
            .lock()
            .offsets
            .get(&session.session_id)
            .copied()
            .unwrap_or(0))
    }

    async fn finalize_upload(
        &self,
        token: &SecretString,
        session: &UploadSession,
        metadata: &PostMetadata,
    ) -> Result<PublishedContent> {
        self.enter(ops::FINALIZE_UPLOAD)?;
        self.check_token(token)?;
        let mut state = self.lock();
        state.uploads_finalized.push(metadata.clone());
        Ok(PublishedContent::new(format!("{}-content-{}", self.name, session.session_id)))
    }

    async fn upload_cover(&self, token: &SecretString, data: Bytes, _mime_type: &str) -> Result<String> {
        self.enter(ops::UPLOAD_COVER)?;
        self.check_token(token)?;
        Ok(format!("{}-cover-{}", self.name, data.len()))
    }
}

#[async_trait]
impl ContainerApi for MockApi {
    async fn create_container(&self, token: &SecretString, request: &ContainerRequest) -> Result<String> {
        self.enter(ops::CREATE_CONTAINER)?;
        self.check_token(token)?;
        let mut state = self.lock();
        state.containers.push(request.clone());
        Ok(format!("container-{}", state.containers.len()))
    }

    async fn container_status(&self, token: &SecretString, container_id: &str) -> Result<String> {
        self.enter(ops::CONTAINER_STATUS)?;
        self.check_token(token)?;
        let mut state = self.lock();
        let default_status = state.default_status.clone();
        match state.status_scripts.get_mut(container_id) {
            Some(script) if script.len() > 1 => Ok(script.pop_front().unwrap_or(default_status)),
            Some(script) => Ok(script.front().cloned().unwrap_or(default_status)),
            None => Ok(default_status),
        }
    }

    async fn publish_container(&self, token: &SecretString, container_id: &str) -> Result<PublishedContent> {
        self.enter(ops::PUBLISH_CONTAINER)?;
        self.check_token(token)?;
        let mut state = self.lock();
        state.published_containers.push(container_id.to_string());
        let content = PublishedContent::new(format!("media-{}", container_id))
            .with_permalink(format!("https://{}.example/p/{}", self.name, container_id));

        let children = container_id
            .strip_prefix("container-")
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|n| state.containers.get(n.wrapping_sub(1)))
            .map(|request| request.children.clone())
            .unwrap_or_default();
        for id in children.into_iter().chain(std::iter::once(container_id.to_string())) {
            state.published_by_container.insert(id, content.clone());
        }

        if state.take_lost(ops::PUBLISH_CONTAINER) {
            return Err(lost_response());
        }
        Ok(content)
    }

    async fn find_published(&self, token: &SecretString, container_id: &str) -> Result<Option<PublishedContent>> {
        self.enter(ops::FIND_PUBLISHED)?;
        self.check_token(token)?;
        Ok(self.lock().published_by_container.get(container_id).cloned())
    }
}

#[async_trait]
impl PostApi for MockApi {
    async fn create_post(&self, token: &SecretString, request: &PostRequest) -> Result<PublishedContent> {
        self.enter(ops::CREATE_POST)?;
        self.check_token(token)?;
        let mut state = self.lock();
        state.posts.push(request.clone());
        let content = PublishedContent::new(format!("post-{}", state.posts.len()))
            .with_permalink(format!("https://{}.example/status/{}", self.name, state.posts.len()));
        state
            .posts_by_reference
            .insert(request.reference.clone(), content.clone());
        if state.take_lost(ops::CREATE_POST) {
            return Err(lost_response());
        }
        Ok(content)
    }

    async fn find_post(&self, token: &SecretString, reference: &str) -> Result<Option<PublishedContent>> {
        self.enter(ops::FIND_POST)?;
        self.check_token(token)?;
        Ok(self.lock().posts_by_reference.get(reference).cloned())
    }

    async fn update_post(
        &self,
        token: &SecretString,
        content_id: &str,
        update: &PostUpdate,
    ) -> Result<PublishedContent> {
        self.enter(ops::UPDATE_POST)?;
        self.check_token(token)?;
        self.lock().updates.push((content_id.to_string(), update.clone()));
        Ok(PublishedContent::new(content_id))
    }
}

fn lost_response() -> crate::error::OmnicastError {
    PlatformError::Network("connection reset before response".to_string()).into()
}

#[async_trait]
impl MediaSource for MockApi {
    async fn content_length(&self, _url: &str) -> Result<u64> {
        self.enter(ops::CONTENT_LENGTH)?;
        Ok(self.lock().media_length)
    }

    async fn fetch_range(&self, _url: &str, start: u64, end: u64) -> Result<Bytes> {
        self.enter(ops::FETCH_RANGE)?;
        let length = self.lock().media_length;
        if start > end || end >= length {
            return Err(PlatformError::Validation(format!(
                "range {}-{} outside media of {} bytes",
                start, end, length
            ))
            .into());
        }
        Ok(Bytes::from(vec![0u8; (end - start + 1) as usize]))
    }

    async fn fetch(&self, _url: &str) -> Result<Bytes> {
        self.enter(ops::FETCH)?;
        Ok(Bytes::from_static(b"mock-image-bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> SecretString {
        SecretString::from("token".to_string())
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let api = MockApi::new("mock");
        api.fail_next(ops::CREATE_POST, PlatformError::Network("one".to_string()))
            .fail_next(ops::CREATE_POST, PlatformError::RateLimit("two".to_string()));

        let request = PostRequest {
            text: "hi".to_string(),
            media_ids: vec![],
            link: None,
            reference: "task-1".to_string(),
        };

        assert!(api.create_post(&token(), &request).await.is_err());
        assert!(api.create_post(&token(), &request).await.is_err());
        assert!(api.create_post(&token(), &request).await.is_ok());
        assert_eq!(api.calls(ops::CREATE_POST), 3);
        assert_eq!(api.created_posts().len(), 1);
    }

    #[tokio::test]
    async fn test_status_script_repeats_last_value() {
        let api = MockApi::new("mock");
        api.script_status("container-1", &["IN_PROGRESS", "FINISHED"]);

        assert_eq!(api.container_status(&token(), "container-1").await.unwrap(), "IN_PROGRESS");
        assert_eq!(api.container_status(&token(), "container-1").await.unwrap(), "FINISHED");
        assert_eq!(api.container_status(&token(), "container-1").await.unwrap(), "FINISHED");
        assert_eq!(api.container_status(&token(), "container-9").await.unwrap(), "FINISHED");
    }

    #[tokio::test]
    async fn test_rejected_token_answers_unauthorized() {
        let api = MockApi::new("mock");
        api.reject_token("token");
        let result = api.container_status(&token(), "container-1").await;
        assert!(matches!(
            result,
            Err(crate::error::OmnicastError::Platform(PlatformError::Authentication(_)))
        ));
    }

    #[tokio::test]
    async fn test_lost_ack_still_advances_offset() {
        let api = MockApi::new("mock");
        api.set_media_length(10);
        let session = api
            .init_upload(
                &token(),
                &UploadInit {
                    file_name: "a.mp4".to_string(),
                    mime_type: "video/mp4".to_string(),
                    total_size: 10,
                    chunk_size: 5,
                    total_chunks: 2,
                    metadata: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();
        api.lose_next_acks(1);

        let segment = Segment {
            index: 0,
            start: 0,
            end: 4,
            total: 10,
        };
        let data = api.fetch_range("mock://a.mp4", 0, 4).await.unwrap();
        assert!(api
            .transfer_segment(&token(), &session, &segment, data)
            .await
            .is_err());
        assert_eq!(api.acknowledged_offset(&token(), &session).await.unwrap(), 5);
    }
}

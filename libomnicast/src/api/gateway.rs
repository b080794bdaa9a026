//! HTTP implementation of the API capabilities
//!
//! Each destination is reached through a gateway base URL from
//! `[destinations.<name>]`. The gateway exposes one JSON-over-HTTP surface for
//! every destination and does the vendor-specific request signing.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{
    ContainerApi, ContainerRequest, MediaSource, PostApi, PostMetadata, PostRequest, PostUpdate, Segment,
    SegmentAck, SegmentedUploadApi, TokenApi, TokenGrant, UploadInit, UploadSession,
};
use crate::config::DestinationConfig;
use crate::error::{ConfigError, PlatformError, Result};
use crate::types::{Destination, PublishedContent};

#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    destination: Destination,
}

#[derive(Deserialize)]
struct OffsetResponse {
    offset: u64,
}

#[derive(Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Deserialize)]
struct CoverResponse {
    cover: String,
}

impl GatewayClient {
    pub fn new(destination: Destination, config: &DestinationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP client for {}: {}", destination, e)))?;

        Ok(Self {
            http,
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            destination,
        })
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, context: &str) -> Result<T> {
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(self.destination, &e, context))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(self.destination, status, &body, context).into());
        }

        response
            .json::<T>()
            .await
            .map_err(|e| {
                PlatformError::Network(format!(
                    "{} returned an unreadable response ({}): {}",
                    self.destination, context, e
                ))
                .into()
            })
    }

    /// Like [`send_json`](Self::send_json), but a 404 answers `None`
    async fn send_optional_json<T: DeserializeOwned>(&self, request: RequestBuilder, context: &str) -> Result<Option<T>> {
        let response = request
            .send()
            .await
            .map_err(|e| map_transport_error(self.destination, &e, context))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let found = response.json::<T>().await.map_err(|e| {
                    PlatformError::Network(format!("{} {} response: {}", self.destination, context, e))
                })?;
                Ok(Some(found))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(map_status_error(self.destination, status, &body, context).into())
            }
        }
    }
}

#[async_trait]
impl TokenApi for GatewayClient {
    async fn refresh_token(&self, refresh_token: &SecretString) -> Result<TokenGrant> {
        let request = self
            .http
            .post(self.url("oauth/refresh"))
            .json(&serde_json::json!({ "refresh_token": refresh_token.expose_secret() }));
        self.send_json(request, "refresh token").await
    }
}

#[async_trait]
impl SegmentedUploadApi for GatewayClient {
    async fn init_upload(&self, token: &SecretString, init: &UploadInit) -> Result<UploadSession> {
        let request = self
            .http
            .post(self.url("uploads"))
            .bearer_auth(token.expose_secret())
            .json(init);
        self.send_json(request, "init upload").await
    }

    async fn transfer_segment(
        &self,
        token: &SecretString,
        session: &UploadSession,
        segment: &Segment,
        data: Bytes,
    ) -> Result<SegmentAck> {
        debug!(
            destination = %self.destination,
            session = %session.session_id,
            part = segment.part_number(),
            range = %segment.content_range(),
            "Uploading segment"
        );
        let request = self
            .http
            .put(self.url(&format!(
                "uploads/{}/segments/{}",
                session.session_id, segment.index
            )))
            .bearer_auth(token.expose_secret())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_RANGE, segment.content_range())
            .body(data);
        self.send_json(request, "upload segment").await
    }

    async fn acknowledged_offset(&self, token: &SecretString, session: &UploadSession) -> Result<u64> {
        let request = self
            .http
            .get(self.url(&format!("uploads/{}/offset", session.session_id)))
            .bearer_auth(token.expose_secret());
        let response: OffsetResponse = self.send_json(request, "query upload offset").await?;
        Ok(response.offset)
    }

    async fn finalize_upload(
        &self,
        token: &SecretString,
        session: &UploadSession,
        metadata: &PostMetadata,
    ) -> Result<PublishedContent> {
        let request = self
            .http
            .post(self.url(&format!("uploads/{}/finalize", session.session_id)))
            .bearer_auth(token.expose_secret())
            .json(metadata);
        self.send_json(request, "finalize upload").await
    }

    async fn upload_cover(&self, token: &SecretString, data: Bytes, mime_type: &str) -> Result<String> {
        let request = self
            .http
            .post(self.url("covers"))
            .bearer_auth(token.expose_secret())
            .header(CONTENT_TYPE, mime_type)
            .body(data);
        let response: CoverResponse = self.send_json(request, "upload cover").await?;
        Ok(response.cover)
    }
}

#[async_trait]
impl ContainerApi for GatewayClient {
    async fn create_container(&self, token: &SecretString, container: &ContainerRequest) -> Result<String> {
        let request = self
            .http
            .post(self.url("containers"))
            .bearer_auth(token.expose_secret())
            .json(container);
        let response: IdResponse = self.send_json(request, "create container").await?;
        Ok(response.id)
    }

    async fn container_status(&self, token: &SecretString, container_id: &str) -> Result<String> {
        let request = self
            .http
            .get(self.url(&format!("containers/{}", container_id)))
            .bearer_auth(token.expose_secret());
        let response: StatusResponse = self.send_json(request, "container status").await?;
        Ok(response.status)
    }

    async fn publish_container(&self, token: &SecretString, container_id: &str) -> Result<PublishedContent> {
        let request = self
            .http
            .post(self.url(&format!("containers/{}/publish", container_id)))
            .bearer_auth(token.expose_secret());
        self.send_json(request, "publish container").await
    }

    async fn find_published(&self, token: &SecretString, container_id: &str) -> Result<Option<PublishedContent>> {
        let request = self
            .http
            .get(self.url(&format!("containers/{}/published", container_id)))
            .bearer_auth(token.expose_secret());
        self.send_optional_json(request, "find published media").await
    }
}

#[async_trait]
impl PostApi for GatewayClient {
    async fn create_post(&self, token: &SecretString, post: &PostRequest) -> Result<PublishedContent> {
        let request = self
            .http
            .post(self.url("posts"))
            .bearer_auth(token.expose_secret())
            .json(post);
        self.send_json(request, "create post").await
    }

    async fn find_post(&self, token: &SecretString, reference: &str) -> Result<Option<PublishedContent>> {
        let request = self
            .http
            .get(self.url("posts"))
            .bearer_auth(token.expose_secret())
            .query(&[("reference", reference)]);
        self.send_optional_json(request, "find post").await
    }

    async fn update_post(
        &self,
        token: &SecretString,
        content_id: &str,
        update: &PostUpdate,
    ) -> Result<PublishedContent> {
        let request = self
            .http
            .patch(self.url(&format!("posts/{}", content_id)))
            .bearer_auth(token.expose_secret())
            .json(update);
        self.send_json(request, "update post").await
    }
}

/// Reads source media over plain HTTP
#[derive(Clone)]
pub struct HttpMediaSource {
    http: reqwest::Client,
}

impl HttpMediaSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("HTTP client for media source: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl MediaSource for HttpMediaSource {
    async fn content_length(&self, url: &str) -> Result<u64> {
        let response = self
            .http
            .head(url)
            .send()
            .await
            .map_err(|e| media_error(&e, url))?;

        if !response.status().is_success() {
            return Err(media_status_error(response.status(), url).into());
        }

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                PlatformError::Validation(format!("media at {} has no content length", url)).into()
            })
    }

    async fn fetch_range(&self, url: &str, start: u64, end: u64) -> Result<Bytes> {
        let response = self
            .http
            .get(url)
            .header(RANGE, format!("bytes={}-{}", start, end))
            .send()
            .await
            .map_err(|e| media_error(&e, url))?;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
            return Err(media_status_error(status, url).into());
        }

        let body = response.bytes().await.map_err(|e| media_error(&e, url))?;

        // A server that ignores Range sends the whole file
        if status == StatusCode::OK {
            let from = start as usize;
            let to = (end as usize + 1).min(body.len());
            if from >= to {
                return Err(PlatformError::Validation(format!(
                    "range {}-{} is outside media at {}",
                    start, end, url
                ))
                .into());
            }
            return Ok(body.slice(from..to));
        }
        Ok(body)
    }

    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| media_error(&e, url))?;

        if !response.status().is_success() {
            return Err(media_status_error(response.status(), url).into());
        }

        response.bytes().await.map_err(|e| media_error(&e, url).into())
    }
}

fn media_error(error: &reqwest::Error, url: &str) -> PlatformError {
    if error.is_timeout() {
        PlatformError::Timeout(format!("fetching media {}: {}", url, error))
    } else {
        PlatformError::Network(format!("fetching media {}: {}", url, error))
    }
}

fn media_status_error(status: StatusCode, url: &str) -> PlatformError {
    if status.is_server_error() {
        PlatformError::Network(format!("media host returned {} for {}", status, url))
    } else {
        PlatformError::Validation(format!("media at {} is not readable ({})", url, status))
    }
}

/// Map a transport failure (connect, timeout, reset) to the error taxonomy
pub fn map_transport_error(destination: Destination, error: &reqwest::Error, context: &str) -> PlatformError {
    if error.is_timeout() {
        PlatformError::Timeout(format!("{} {} timed out: {}", destination, context, error))
    } else {
        PlatformError::Network(format!("{} {} failed: {}", destination, context, error))
    }
}

/// Map a non-success HTTP status to the error taxonomy
pub fn map_status_error(destination: Destination, status: StatusCode, body: &str, context: &str) -> PlatformError {
    let detail = extract_error_message(body).unwrap_or_else(|| body.trim().to_string());

    match status.as_u16() {
        401 | 403 => PlatformError::Authentication(format!(
            "{} rejected the access token ({}): {}",
            destination, context, detail
        )),
        400 | 413 | 415 | 422 => PlatformError::Validation(format!(
            "{} rejected the request ({}): {}",
            destination, context, detail
        )),
        409 => PlatformError::Rejected(format!("{} ({}): {}", destination, context, detail)),
        408 | 504 => PlatformError::Timeout(format!(
            "{} timed out ({}): {}",
            destination, context, detail
        )),
        429 => PlatformError::RateLimit(format!(
            "{} rate limit exceeded ({}): {}",
            destination, context, detail
        )),
        500..=599 => PlatformError::Network(format!(
            "{} server error {} ({}): {}",
            destination, status, context, detail
        )),
        _ => PlatformError::Rejected(format!(
            "{} returned {} ({}): {}",
            destination, status, context, detail
        )),
    }
}

/// Pull `error.message`, `error` or `message` out of a JSON error body
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let candidate = value
        .pointer("/error/message")
        .or_else(|| value.get("error"))
        .or_else(|| value.get("message"))?;
    match candidate {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_follows_taxonomy() {
        let d = Destination::Instagram;
        assert!(matches!(
            map_status_error(d, StatusCode::UNAUTHORIZED, "", "x"),
            PlatformError::Authentication(_)
        ));
        assert!(matches!(
            map_status_error(d, StatusCode::UNPROCESSABLE_ENTITY, "", "x"),
            PlatformError::Validation(_)
        ));
        assert!(matches!(
            map_status_error(d, StatusCode::TOO_MANY_REQUESTS, "", "x"),
            PlatformError::RateLimit(_)
        ));
        assert!(matches!(
            map_status_error(d, StatusCode::BAD_GATEWAY, "", "x"),
            PlatformError::Network(_)
        ));
        assert!(matches!(
            map_status_error(d, StatusCode::GATEWAY_TIMEOUT, "", "x"),
            PlatformError::Timeout(_)
        ));
        assert!(matches!(
            map_status_error(d, StatusCode::CONFLICT, "", "x"),
            PlatformError::Rejected(_)
        ));
    }

    #[test]
    fn test_status_mapping_uses_json_error_message() {
        let error = map_status_error(
            Destination::Youtube,
            StatusCode::BAD_REQUEST,
            r#"{"error":{"message":"title too long"}}"#,
            "finalize upload",
        );
        assert!(error.to_string().contains("title too long"));

        let error = map_status_error(
            Destination::Tiktok,
            StatusCode::FORBIDDEN,
            r#"{"message":"scope missing"}"#,
            "init upload",
        );
        assert!(error.to_string().contains("scope missing"));
    }

    #[test]
    fn test_plain_text_error_body_is_kept() {
        let error = map_status_error(
            Destination::Bilibili,
            StatusCode::INTERNAL_SERVER_ERROR,
            "upstream unavailable",
            "upload segment",
        );
        assert!(error.is_transient());
        assert!(error.to_string().contains("upstream unavailable"));
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = GatewayClient::new(
            Destination::Threads,
            &DestinationConfig {
                enabled: true,
                gateway_url: "http://localhost:9000/threads/".to_string(),
                request_timeout_secs: 5,
            },
        )
        .unwrap();
        assert_eq!(client.url("/containers"), "http://localhost:9000/threads/containers");
        assert_eq!(client.destination(), Destination::Threads);
    }
}

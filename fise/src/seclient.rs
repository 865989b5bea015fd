use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::auth::{AuthError, TokenSource};
use crate::element::HealthStatus;

/// Outcome classes for storage-element calls. The upload and finalize
/// coordinators branch on these, so the mapping from HTTP result to variant
/// is the load-bearing part of this module.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SeError {
    /// 507: the element cannot take this file, try somewhere else.
    InsufficientStorage,
    /// 404 on an element call usually means our endpoint map is stale.
    NotFound,
    Unauthorized,
    /// connect/timeout/dns: the element itself is unreachable
    Unavailable,
    Server(StatusCode),
    Client(StatusCode),
    InvalidResponse,
    Auth(#[from] AuthError),
}

impl std::fmt::Display for SeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl SeError {
    /// True when the right reaction is a lazy catalogue reload followed by
    /// one reselection.
    pub fn suggests_stale_config(&self) -> bool {
        matches!(
            self,
            SeError::InsufficientStorage | SeError::NotFound | SeError::Unavailable
        )
    }
}

pub mod wire {
    use super::*;

    /// `GET {endpoint}/capacity` body. The element reports its own health
    /// but the monitor derives its view from the HTTP outcome.
    #[derive(Debug, Clone, Deserialize)]
    pub struct CapacityProbe {
        pub capacity_total: u64,
        pub capacity_used: u64,
        pub capacity_free: Option<u64>,
        pub capacity_percent: Option<f64>,
        pub health_status: Option<HealthStatus>,
    }

    /// The element's record of a stored file.
    #[derive(Debug, Clone, Deserialize)]
    pub struct SeFileRecord {
        pub file_id: String,
        pub storage_filename: String,
        pub file_size: u64,
        pub checksum: String,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct DigestResponse {
        pub algorithm: String,
        pub digest: String,
    }

    #[derive(Serialize)]
    pub(super) struct CopyRequest<'a> {
        pub(super) target_endpoint: &'a str,
        pub(super) target_bearer: &'a str,
        pub(super) file_id: &'a str,
    }
}

pub use wire::{CapacityProbe, DigestResponse, SeFileRecord};

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub data: Bytes,
    /// Optional request-level override of the configured upload timeout.
    pub timeout: Option<Duration>,
}

/// One element's HTTP API. Endpoints are passed per call because the client
/// is shared across the whole fleet; connection pooling happens per host in
/// reqwest underneath.
#[async_trait]
pub trait ElementApi: Send + Sync {
    async fn capacity(&self, endpoint: &str) -> Result<CapacityProbe, SeError>;
    async fn upload(&self, endpoint: &str, req: &UploadRequest) -> Result<SeFileRecord, SeError>;
    /// Ask the source element to push its copy of `file_id` to the target
    /// element. The source streams bytes directly; we never proxy them.
    async fn copy_to(
        &self,
        source_endpoint: &str,
        file_id: &str,
        target_endpoint: &str,
    ) -> Result<(), SeError>;
    async fn digest(&self, endpoint: &str, file_id: &str) -> Result<DigestResponse, SeError>;
    /// Idempotent by file id: deleting something already gone is success.
    async fn delete(&self, endpoint: &str, file_id: &str) -> Result<(), SeError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SeTimeouts {
    pub capacity: Duration,
    pub upload: Duration,
    pub control: Duration,
}

impl Default for SeTimeouts {
    fn default() -> Self {
        SeTimeouts {
            capacity: Duration::from_secs(5),
            upload: Duration::from_secs(300),
            control: Duration::from_secs(10),
        }
    }
}

pub struct SeClient {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    timeouts: SeTimeouts,
}

impl SeClient {
    pub fn new(tokens: Arc<dyn TokenSource>, timeouts: SeTimeouts) -> Result<Self, SeError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|_| SeError::Unavailable)?;
        Ok(SeClient {
            client,
            tokens,
            timeouts,
        })
    }

    // every element call goes through here so the 401-retry discipline is in
    // one place. build is called again on retry because multipart bodies
    // cannot be cloned
    async fn send_with_auth<F>(&self, build: F) -> Result<reqwest::Response, SeError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder + Send + Sync,
    {
        let bearer = self.tokens.token().await?;
        let res = build(&self.client, &bearer)
            .send()
            .await
            .map_err(classify_transport)?;
        if res.status() != StatusCode::UNAUTHORIZED && res.status() != StatusCode::FORBIDDEN {
            return Ok(res);
        }
        // the cached token may have been revoked before its expiry; force
        // exactly one refresh and one retry
        let bearer = self.tokens.refresh().await?;
        build(&self.client, &bearer)
            .send()
            .await
            .map_err(classify_transport)
    }
}

#[async_trait]
impl ElementApi for SeClient {
    async fn capacity(&self, endpoint: &str) -> Result<CapacityProbe, SeError> {
        let url = format!("{endpoint}/capacity");
        trace!("GET {url}");
        let timeout = self.timeouts.capacity;
        let res = self
            .send_with_auth(|client, bearer| {
                client
                    .request(Method::GET, &url)
                    .timeout(timeout)
                    .bearer_auth(bearer)
            })
            .await?;
        match res.status() {
            StatusCode::OK => res.json().await.map_err(|_| SeError::InvalidResponse),
            status => Err(classify_status(status)),
        }
    }

    async fn upload(&self, endpoint: &str, req: &UploadRequest) -> Result<SeFileRecord, SeError> {
        let url = format!("{endpoint}/files/upload");
        trace!("POST {url} size={}", req.data.len());
        let timeout = req.timeout.unwrap_or(self.timeouts.upload);
        let res = self
            .send_with_auth(|client, bearer| {
                // Bytes clones are refcounted so rebuilding the form on the
                // 401 retry path does not copy the payload
                let part = reqwest::multipart::Part::stream(reqwest::Body::from(req.data.clone()))
                    .file_name(req.file_name.clone());
                let form = reqwest::multipart::Form::new().part("file", part);
                client
                    .request(Method::POST, &url)
                    .timeout(timeout)
                    .bearer_auth(bearer)
                    .multipart(form)
            })
            .await?;
        match res.status() {
            StatusCode::OK | StatusCode::CREATED => {
                res.json().await.map_err(|_| SeError::InvalidResponse)
            }
            status => Err(classify_status(status)),
        }
    }

    async fn copy_to(
        &self,
        source_endpoint: &str,
        file_id: &str,
        target_endpoint: &str,
    ) -> Result<(), SeError> {
        let url = format!("{source_endpoint}/files/{file_id}/copy");
        trace!("POST {url} target={target_endpoint}");
        // the source element needs its own credential for the target
        let target_bearer = self.tokens.token().await?;
        let timeout = self.timeouts.upload;
        let res = self
            .send_with_auth(|client, bearer| {
                client
                    .request(Method::POST, &url)
                    .timeout(timeout)
                    .bearer_auth(bearer)
                    .json(&wire::CopyRequest {
                        target_endpoint,
                        target_bearer: &target_bearer,
                        file_id,
                    })
            })
            .await?;
        match res.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => {
                Ok(())
            }
            status => Err(classify_status(status)),
        }
    }

    async fn digest(&self, endpoint: &str, file_id: &str) -> Result<DigestResponse, SeError> {
        let url = format!("{endpoint}/files/{file_id}/digest");
        trace!("GET {url}");
        let timeout = self.timeouts.control;
        let res = self
            .send_with_auth(|client, bearer| {
                client
                    .request(Method::GET, &url)
                    .timeout(timeout)
                    .bearer_auth(bearer)
            })
            .await?;
        match res.status() {
            StatusCode::OK => {
                let body: DigestResponse = res.json().await.map_err(|_| SeError::InvalidResponse)?;
                if body.digest.is_empty() {
                    return Err(SeError::InvalidResponse);
                }
                Ok(body)
            }
            status => Err(classify_status(status)),
        }
    }

    async fn delete(&self, endpoint: &str, file_id: &str) -> Result<(), SeError> {
        let url = format!("{endpoint}/files/{file_id}");
        trace!("DELETE {url}");
        let timeout = self.timeouts.control;
        let res = self
            .send_with_auth(|client, bearer| {
                client
                    .request(Method::DELETE, &url)
                    .timeout(timeout)
                    .bearer_auth(bearer)
            })
            .await?;
        match res.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            // already gone counts as deleted
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(classify_status(status)),
        }
    }
}

fn classify_status(status: StatusCode) -> SeError {
    match status {
        StatusCode::INSUFFICIENT_STORAGE => SeError::InsufficientStorage,
        StatusCode::NOT_FOUND => SeError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SeError::Unauthorized,
        s if s.is_server_error() => SeError::Server(s),
        s if s.is_client_error() => SeError::Client(s),
        _ => SeError::InvalidResponse,
    }
}

fn classify_transport(e: reqwest::Error) -> SeError {
    if e.is_connect() || e.is_timeout() {
        SeError::Unavailable
    } else if e.is_decode() {
        SeError::InvalidResponse
    } else {
        SeError::Unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::INSUFFICIENT_STORAGE),
            SeError::InsufficientStorage
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            SeError::NotFound
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED),
            SeError::Unauthorized
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            SeError::Unauthorized
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            SeError::Server(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            SeError::Client(_)
        ));
    }

    #[test]
    fn stale_config_signals() {
        assert!(SeError::InsufficientStorage.suggests_stale_config());
        assert!(SeError::NotFound.suggests_stale_config());
        assert!(SeError::Unavailable.suggests_stale_config());
        assert!(!SeError::Server(StatusCode::INTERNAL_SERVER_ERROR).suggests_stale_config());
        assert!(!SeError::Client(StatusCode::BAD_REQUEST).suggests_stale_config());
        assert!(!SeError::Unauthorized.suggests_stale_config());
    }

    #[test]
    fn capacity_probe_parses_minimal_body() {
        let probe: CapacityProbe = serde_json::from_str(
            r#"{"capacity_total": 1000, "capacity_used": 250}"#,
        )
        .unwrap();
        assert_eq!(1000, probe.capacity_total);
        assert_eq!(250, probe.capacity_used);
        assert!(probe.health_status.is_none());
    }

    #[test]
    fn capacity_probe_parses_full_body() {
        let probe: CapacityProbe = serde_json::from_str(
            r#"{"capacity_total": 1000, "capacity_used": 250, "capacity_free": 750,
                "capacity_percent": 25.0, "health_status": "healthy"}"#,
        )
        .unwrap();
        assert_eq!(Some(HealthStatus::Healthy), probe.health_status);
    }
}

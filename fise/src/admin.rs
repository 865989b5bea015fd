use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::trace;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::auth::{AuthError, TokenSource};
use crate::element::{CapacityEntry, Mode, RetentionPolicy};

/// The admin service owns the authoritative element catalogue and the file
/// registry. Everything here collapses to "admin unavailable" for callers
/// that only care whether the fallback path worked; the variants exist so
/// logs say why.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdminError {
    Unavailable,
    Unauthorized,
    NotFound,
    InvalidResponse,
    Status(StatusCode),
    Auth(#[from] AuthError),
}

impl std::fmt::Display for AdminError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One catalogue row as the admin reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueEntry {
    pub element_id: String,
    pub endpoint: String,
    pub priority: i64,
    pub mode: Mode,
}

/// The admin's record of a file, consulted before finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub retention_policy: RetentionPolicy,
    pub storage_element_id: String,
    pub file_size: u64,
    pub checksum: Option<String>,
}

#[async_trait]
pub trait AdminApi: Send + Sync {
    /// The full catalogue of registered elements. Fallback source of truth
    /// when the registry is down; callers label this path `source=admin`.
    async fn list_available_elements(&self) -> Result<Vec<CatalogueEntry>, AdminError>;

    /// Capacity as the admin last saw it. May be staler than registry data.
    async fn get_capacity(&self, element_id: &str) -> Result<CapacityEntry, AdminError>;

    async fn get_file(&self, file_id: &str) -> Result<FileRecord, AdminError>;

    /// Point the authoritative registry at the new home of a file. This is
    /// the commit step of finalization; after it returns Ok the move is
    /// irrevocable.
    async fn commit_file_location(
        &self,
        file_id: &str,
        element_id: &str,
    ) -> Result<(), AdminError>;
}

pub struct AdminClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

mod wire {
    use super::*;

    #[derive(Deserialize)]
    pub(super) struct ElementList {
        pub(super) elements: Vec<CatalogueEntry>,
    }

    #[derive(Serialize)]
    pub(super) struct CommitLocation<'a> {
        pub(super) storage_element_id: &'a str,
        pub(super) retention_policy: RetentionPolicy,
    }
}

impl AdminClient {
    pub fn new(
        base_url: String,
        tokens: Arc<dyn TokenSource>,
        timeout: Duration,
    ) -> Result<Self, AdminError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|_| AdminError::Unavailable)?;
        Ok(AdminClient {
            client,
            base_url,
            tokens,
        })
    }

    async fn send<F>(&self, build: F) -> Result<reqwest::Response, AdminError>
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
        let bearer = self.tokens.refresh().await?;
        build(&self.client, &bearer)
            .send()
            .await
            .map_err(classify_transport)
    }
}

#[async_trait]
impl AdminApi for AdminClient {
    async fn list_available_elements(&self) -> Result<Vec<CatalogueEntry>, AdminError> {
        let url = format!("{}/api/v1/storage-elements/available", self.base_url);
        trace!("GET {url}");
        let res = self
            .send(|client, bearer| client.request(Method::GET, &url).bearer_auth(bearer))
            .await?;
        match res.status() {
            StatusCode::OK => {
                let body: wire::ElementList =
                    res.json().await.map_err(|_| AdminError::InvalidResponse)?;
                Ok(body.elements)
            }
            status => Err(classify_status(status)),
        }
    }

    async fn get_capacity(&self, element_id: &str) -> Result<CapacityEntry, AdminError> {
        let url = format!(
            "{}/api/v1/storage-elements/{element_id}/capacity",
            self.base_url
        );
        trace!("GET {url}");
        let res = self
            .send(|client, bearer| client.request(Method::GET, &url).bearer_auth(bearer))
            .await?;
        match res.status() {
            StatusCode::OK => res.json().await.map_err(|_| AdminError::InvalidResponse),
            status => Err(classify_status(status)),
        }
    }

    async fn get_file(&self, file_id: &str) -> Result<FileRecord, AdminError> {
        let url = format!("{}/api/v1/files/{file_id}", self.base_url);
        trace!("GET {url}");
        let res = self
            .send(|client, bearer| client.request(Method::GET, &url).bearer_auth(bearer))
            .await?;
        match res.status() {
            StatusCode::OK => res.json().await.map_err(|_| AdminError::InvalidResponse),
            status => Err(classify_status(status)),
        }
    }

    async fn commit_file_location(
        &self,
        file_id: &str,
        element_id: &str,
    ) -> Result<(), AdminError> {
        let url = format!("{}/api/v1/files/{file_id}/location", self.base_url);
        trace!("PUT {url} element={element_id}");
        let res = self
            .send(|client, bearer| {
                client
                    .request(Method::PUT, &url)
                    .bearer_auth(bearer)
                    .json(&wire::CommitLocation {
                        storage_element_id: element_id,
                        retention_policy: RetentionPolicy::Permanent,
                    })
            })
            .await?;
        match res.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => Err(classify_status(status)),
        }
    }
}

fn classify_status(status: StatusCode) -> AdminError {
    match status {
        StatusCode::NOT_FOUND => AdminError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdminError::Unauthorized,
        s => AdminError::Status(s),
    }
}

fn classify_transport(e: reqwest::Error) -> AdminError {
    if e.is_decode() {
        AdminError::InvalidResponse
    } else {
        AdminError::Unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_entry_roundtrip() {
        let json = r#"{"element_id":"se-a","endpoint":"http://se-a:9000","priority":100,"mode":"edit"}"#;
        let e: CatalogueEntry = serde_json::from_str(json).unwrap();
        assert_eq!("se-a", e.element_id);
        assert_eq!(Mode::Edit, e.mode);
        assert_eq!(100, e.priority);
    }

    #[test]
    fn file_record_parses() {
        let json = r#"{"file_id":"f1","retention_policy":"temporary",
            "storage_element_id":"se-a","file_size":1024,"checksum":"ab12"}"#;
        let r: FileRecord = serde_json::from_str(json).unwrap();
        assert_eq!(RetentionPolicy::Temporary, r.retention_policy);
        assert_eq!("se-a", r.storage_element_id);
    }
}

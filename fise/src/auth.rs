use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, trace, warn};
use reqwest::{Method, StatusCode};
use tokio::sync::Mutex;

pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(300);
// the token endpoint is not required to send expires_in
const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    Unauthorized,
    Unavailable,
    InvalidResponse,
    ServerError(StatusCode),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Something that can produce a bearer token for outbound calls. The
/// coordinators only ever see this trait so tests can hand them a constant.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A currently valid bearer, refreshing if needed.
    async fn token(&self) -> Result<String, AuthError>;

    /// Drop whatever is cached and fetch a new token. Used after a 401 from
    /// a downstream that suggests the cached token went bad early.
    async fn refresh(&self) -> Result<String, AuthError>;
}

#[derive(Clone)]
pub struct AuthConfig {
    pub admin_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_skew: Duration,
    pub timeout: Duration,
}

// no Debug derive: client_secret must never end up in logs

struct CachedToken {
    bearer: String,
    expires_at: DateTime<Utc>,
    issued_at: DateTime<Utc>,
}

/// Client-credentials token issuer against the admin service.
///
/// The cached token is valid while now < expires_at - refresh_skew.
/// Concurrent callers that all find it invalid serialize on the refresh
/// gate; whoever gets the lock first does the POST and everyone behind it
/// re-checks the cache instead of issuing a duplicate request.
pub struct AuthClient {
    client: reqwest::Client,
    config: AuthConfig,
    cached: ArcSwap<Option<CachedToken>>,
    refresh_gate: Mutex<()>,
}

mod wire {
    use serde::Deserialize;

    #[derive(Deserialize)]
    pub(super) struct TokenResponse {
        pub(super) access_token: String,
        pub(super) expires_in: Option<u64>,
    }
}

impl AuthClient {
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|_| AuthError::Unavailable)?;
        Ok(AuthClient {
            client,
            config,
            cached: ArcSwap::from_pointee(None),
            refresh_gate: Mutex::new(()),
        })
    }

    fn cached_valid(&self, now: DateTime<Utc>) -> Option<String> {
        let guard = self.cached.load();
        match guard.as_ref() {
            Some(tok) => {
                let skew = chrono::Duration::from_std(self.config.refresh_skew).ok()?;
                if now < tok.expires_at - skew {
                    Some(tok.bearer.clone())
                } else {
                    None
                }
            }
            None => None,
        }
    }

    async fn fetch(&self) -> Result<String, AuthError> {
        let url = format!("{}/api/v1/auth/token", self.config.admin_url);
        trace!("POST {url}");
        let res = self
            .client
            .request(Method::POST, &url)
            .json(&serde_json::json!({
                "grant_type": "client_credentials",
                "client_id": self.config.client_id,
                "client_secret": self.config.client_secret,
            }))
            .send()
            .await
            .map_err(classify_transport)?;

        match res.status() {
            StatusCode::OK => {
                let body: wire::TokenResponse =
                    res.json().await.map_err(|_| AuthError::InvalidResponse)?;
                if body.access_token.is_empty() {
                    return Err(AuthError::InvalidResponse);
                }
                let expires_in = body
                    .expires_in
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_EXPIRES_IN);
                if expires_in <= self.config.refresh_skew {
                    // the cache entry below is born stale; the caller still
                    // gets this token, the next caller refreshes again
                    warn!("token expires_in {expires_in:?} is within the refresh skew");
                }
                let now = Utc::now();
                let expires_at = now
                    + chrono::Duration::from_std(expires_in)
                        .unwrap_or_else(|_| chrono::Duration::seconds(0));
                self.cached.store(Arc::new(Some(CachedToken {
                    bearer: body.access_token.clone(),
                    expires_at,
                    issued_at: now,
                })));
                info!("issued service token, expires_at={expires_at}");
                Ok(body.access_token)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AuthError::Unauthorized),
            s if s.is_server_error() => Err(AuthError::ServerError(s)),
            _ => Err(AuthError::InvalidResponse),
        }
    }
}

#[async_trait]
impl TokenSource for AuthClient {
    async fn token(&self) -> Result<String, AuthError> {
        if let Some(bearer) = self.cached_valid(Utc::now()) {
            return Ok(bearer);
        }
        let _gate = self.refresh_gate.lock().await;
        // someone ahead of us in the gate may have already refreshed
        if let Some(bearer) = self.cached_valid(Utc::now()) {
            return Ok(bearer);
        }
        // on failure the previous token (if any) stays cached untouched
        self.fetch().await
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        let _gate = self.refresh_gate.lock().await;
        // racing 401 handlers all land here; whoever queued behind the
        // winner gets the token that refresh just produced
        if let Some(tok) = self.cached.load().as_ref() {
            if Utc::now().signed_duration_since(tok.issued_at) < chrono::Duration::seconds(5) {
                return Ok(tok.bearer.clone());
            }
        }
        self.fetch().await
    }
}

fn classify_transport(e: reqwest::Error) -> AuthError {
    if e.is_connect() || e.is_timeout() {
        AuthError::Unavailable
    } else if e.is_decode() {
        AuthError::InvalidResponse
    } else {
        AuthError::Unavailable
    }
}

/// Fixed token for tests and for deployments that mount a pre-issued
/// credential instead of a client secret.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

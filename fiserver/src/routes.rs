use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Multipart, Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use http::{header, HeaderMap, StatusCode};
use log::{info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use ficore::finalize::{FinalizeCoordinator, TxnState};
use ficore::registry::{CapacityLookup, RegistryStore};
use ficore::reload::ReloadHandle;
use ficore::select::StorageSelector;
use ficore::upload::UploadCoordinator;
use fise::admin::AdminApi;
use fise::element::RetentionPolicy;
use fise::seclient::UploadRequest;

use crate::api::v1 as apiv1;
use crate::config::Config;

const MAX_DESCRIPTION_LEN: usize = 1000;
// health probes come from every replica of every orchestrator; don't let
// them stampede the registry
const READY_CACHE_TTL: Duration = Duration::from_secs(5);

pub struct Ctx {
    pub config: Config,
    pub uploads: UploadCoordinator,
    pub selector: Arc<StorageSelector>,
    pub finalize: Arc<FinalizeCoordinator>,
    pub registry: Arc<dyn RegistryStore>,
    pub admin: Arc<dyn AdminApi>,
    pub map: ReloadHandle,
    ready_cache: Mutex<Option<(Instant, apiv1::ReadyChecks)>>,
}

impl Ctx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        uploads: UploadCoordinator,
        selector: Arc<StorageSelector>,
        finalize: Arc<FinalizeCoordinator>,
        registry: Arc<dyn RegistryStore>,
        admin: Arc<dyn AdminApi>,
        map: ReloadHandle,
    ) -> Self {
        Ctx {
            config,
            uploads,
            selector,
            finalize,
            registry,
            admin,
            map,
            ready_cache: Mutex::new(None),
        }
    }
}

pub fn router(ctx: Arc<Ctx>) -> Router {
    Router::new()
        .route(apiv1::UPLOAD_PATH, post(upload_file))
        .route(apiv1::FINALIZE_PATH, post(finalize_file))
        .route(apiv1::FINALIZE_STATUS_PATH, get(finalize_status))
        .route(apiv1::ELEMENTS_PATH, get(list_elements))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
        .with_state(ctx)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(apiv1::ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

// the shape check happens here; the admin service issued the token and the
// elements verify it downstream
fn require_bearer(headers: &HeaderMap) -> Result<(), Response> {
    let ok = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| !token.trim().is_empty())
        .unwrap_or(false);
    if ok {
        Ok(())
    } else {
        Err(error_response(
            StatusCode::UNAUTHORIZED,
            "missing or malformed bearer token",
        ))
    }
}

fn parse_retention(raw: Option<&str>) -> Result<RetentionPolicy, String> {
    match raw {
        None | Some("temporary") => Ok(RetentionPolicy::Temporary),
        Some("permanent") => Ok(RetentionPolicy::Permanent),
        Some(other) => Err(format!(
            "retention_policy must be temporary or permanent, got {other}"
        )),
    }
}

fn validate_ttl_days(days: i64) -> Result<(), String> {
    if (1..=365).contains(&days) {
        Ok(())
    } else {
        Err(format!("ttl_days must be within 1..365, got {days}"))
    }
}

fn validate_compression_algorithm(raw: &str) -> Result<(), String> {
    match raw {
        "gzip" | "brotli" => Ok(()),
        other => Err(format!(
            "compression_algorithm must be gzip or brotli, got {other}"
        )),
    }
}

#[derive(Default)]
struct UploadForm {
    data: Option<Bytes>,
    original_filename: Option<String>,
    retention_policy: Option<String>,
    ttl_days: Option<i64>,
    description: Option<String>,
    compress: bool,
    compression_algorithm: Option<String>,
    metadata: Option<String>,
}

async fn read_upload_form(multipart: &mut Multipart) -> Result<UploadForm, String> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("bad multipart body: {e}"))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                form.original_filename = field.file_name().map(str::to_string);
                form.data = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| format!("could not read file part: {e}"))?,
                );
            }
            "retention_policy" => {
                form.retention_policy = Some(text_field(field).await?);
            }
            "ttl_days" => {
                let raw = text_field(field).await?;
                form.ttl_days =
                    Some(raw.parse().map_err(|_| format!("ttl_days is not an integer: {raw}"))?);
            }
            "description" => {
                form.description = Some(text_field(field).await?);
            }
            "compress" => {
                let raw = text_field(field).await?;
                form.compress = raw == "true" || raw == "1";
            }
            "compression_algorithm" => {
                form.compression_algorithm = Some(text_field(field).await?);
            }
            "metadata" => {
                form.metadata = Some(text_field(field).await?);
            }
            other => {
                warn!("ignoring unknown upload field {other}");
            }
        }
    }
    Ok(form)
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, String> {
    field
        .text()
        .await
        .map_err(|e| format!("could not read form field: {e}"))
}

fn validate_upload_form(form: &UploadForm, policy: RetentionPolicy) -> Result<(), String> {
    if let Some(desc) = &form.description {
        if desc.len() > MAX_DESCRIPTION_LEN {
            return Err(format!(
                "description exceeds {MAX_DESCRIPTION_LEN} characters"
            ));
        }
    }
    if let Some(days) = form.ttl_days {
        if policy != RetentionPolicy::Temporary {
            return Err("ttl_days only applies to temporary uploads".to_string());
        }
        validate_ttl_days(days)?;
    }
    if let Some(algo) = &form.compression_algorithm {
        validate_compression_algorithm(algo)?;
    }
    if let Some(raw) = &form.metadata {
        serde_json::from_str::<serde_json::Value>(raw)
            .map_err(|_| "metadata is not valid JSON".to_string())?;
    }
    Ok(())
}

async fn upload_file(
    State(ctx): State<Arc<Ctx>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Err(res) = require_bearer(&headers) {
        return res;
    }
    let form = match read_upload_form(&mut multipart).await {
        Ok(form) => form,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };
    let policy = match parse_retention(form.retention_policy.as_deref()) {
        Ok(p) => p,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };
    if let Err(msg) = validate_upload_form(&form, policy) {
        return error_response(StatusCode::BAD_REQUEST, msg);
    }
    let Some(data) = form.data else {
        return error_response(StatusCode::BAD_REQUEST, "missing file field");
    };
    let original_filename = form
        .original_filename
        .unwrap_or_else(|| "upload".to_string());

    // checksum of exactly the bytes we hand to the element
    let checksum = hex::encode(Sha256::digest(&data));
    let file_size = data.len() as u64;
    let req = UploadRequest {
        file_name: original_filename.clone(),
        data,
        timeout: None,
    };

    match ctx.uploads.upload(&req, policy, None).await {
        Ok(outcome) => {
            let now = Utc::now();
            let ttl_expires_at = match (policy, form.ttl_days) {
                (RetentionPolicy::Temporary, Some(days)) => {
                    Some(now + chrono::Duration::days(days))
                }
                _ => None,
            };
            info!(
                "upload of {original_filename} ({file_size} bytes) placed on {}",
                outcome.element_id
            );
            (
                StatusCode::CREATED,
                Json(apiv1::UploadResponse {
                    file_id: outcome.record.file_id.clone(),
                    original_filename,
                    storage_filename: outcome.record.storage_filename.clone(),
                    file_size,
                    checksum,
                    uploaded_at: now,
                    storage_element_url: outcome.endpoint,
                    retention_policy: policy,
                    ttl_expires_at,
                    storage_element_id: outcome.element_id,
                }),
            )
                .into_response()
        }
        Err(e) => {
            warn!("upload of {original_filename} failed: {e}");
            error_response(StatusCode::from(&e), e.to_string())
        }
    }
}

async fn finalize_file(
    State(ctx): State<Arc<Ctx>>,
    Path(file_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<apiv1::FinalizeRequest>>,
) -> Response {
    if let Err(res) = require_bearer(&headers) {
        return res;
    }
    let req = body.map(|Json(b)| b).unwrap_or_default();
    match ctx
        .finalize
        .submit(&file_id, req.target_storage_element_id.as_deref())
        .await
    {
        Ok(txn) => (
            StatusCode::ACCEPTED,
            Json(apiv1::FinalizeStatus::from(&txn)),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::from(&e), e.to_string()),
    }
}

async fn finalize_status(
    State(ctx): State<Arc<Ctx>>,
    Path(transaction_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(res) = require_bearer(&headers) {
        return res;
    }
    match ctx.finalize.get_status(&transaction_id).await {
        Ok(Some(txn)) => {
            // a transaction that failed verification is a client-visible
            // integrity problem, not a 200
            let status = match txn.state {
                TxnState::Failed | TxnState::RolledBack => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::OK,
            };
            (status, Json(apiv1::FinalizeStatus::from(&txn))).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no such transaction"),
        Err(e) => error_response(StatusCode::from(&e), e.to_string()),
    }
}

async fn list_elements(State(ctx): State<Arc<Ctx>>, headers: HeaderMap) -> Response {
    if let Err(res) = require_bearer(&headers) {
        return res;
    }
    let snapshot = ctx.map.snapshot();
    let mut elements = Vec::with_capacity(snapshot.len());
    for (id, info) in snapshot.iter() {
        let capacity = match ctx.registry.get_capacity(id).await {
            Ok(CapacityLookup::Fresh(entry)) | Ok(CapacityLookup::Stale(entry)) => Some(entry),
            _ => None,
        };
        elements.push(apiv1::ElementView {
            element_id: id.clone(),
            endpoint: info.endpoint.clone(),
            priority: info.priority,
            mode: info.mode,
            capacity,
        });
    }
    Json(apiv1::ElementsResponse { elements }).into_response()
}

async fn health_live() -> &'static str {
    "ok"
}

async fn health_ready(State(ctx): State<Arc<Ctx>>) -> Response {
    let mut cache = ctx.ready_cache.lock().await;
    let checks = match cache.as_ref() {
        Some((at, checks)) if at.elapsed() < READY_CACHE_TTL => checks.clone(),
        _ => {
            let registry = ctx.registry.ping().await;
            let admin = ctx.admin.list_available_elements().await.is_ok();
            // same predicate selection uses, with a zero-byte probe
            let writable_element = ctx
                .selector
                .select(0, RetentionPolicy::Temporary, None)
                .await
                .is_ok()
                || ctx
                    .selector
                    .select(0, RetentionPolicy::Permanent, None)
                    .await
                    .is_ok();
            let checks = apiv1::ReadyChecks {
                registry,
                admin,
                writable_element,
            };
            *cache = Some((Instant::now(), checks.clone()));
            checks
        }
    };
    drop(cache);

    let ready = (checks.registry || checks.admin) && checks.writable_element;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(checks)).into_response()
}

async fn metrics() -> Response {
    match prometheus::TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_defaults_to_temporary() {
        assert_eq!(
            RetentionPolicy::Temporary,
            parse_retention(None).unwrap()
        );
        assert_eq!(
            RetentionPolicy::Temporary,
            parse_retention(Some("temporary")).unwrap()
        );
        assert_eq!(
            RetentionPolicy::Permanent,
            parse_retention(Some("permanent")).unwrap()
        );
        assert!(parse_retention(Some("forever")).is_err());
    }

    #[test]
    fn ttl_day_bounds() {
        assert!(validate_ttl_days(1).is_ok());
        assert!(validate_ttl_days(365).is_ok());
        assert!(validate_ttl_days(0).is_err());
        assert!(validate_ttl_days(366).is_err());
        assert!(validate_ttl_days(-3).is_err());
    }

    #[test]
    fn compression_algorithms() {
        assert!(validate_compression_algorithm("gzip").is_ok());
        assert!(validate_compression_algorithm("brotli").is_ok());
        assert!(validate_compression_algorithm("zstd").is_err());
    }

    #[test]
    fn form_validation() {
        let mut form = UploadForm {
            description: Some("a".repeat(1001)),
            ..UploadForm::default()
        };
        assert!(validate_upload_form(&form, RetentionPolicy::Temporary).is_err());
        form.description = Some("fine".to_string());
        assert!(validate_upload_form(&form, RetentionPolicy::Temporary).is_ok());

        form.ttl_days = Some(30);
        assert!(validate_upload_form(&form, RetentionPolicy::Temporary).is_ok());
        // ttl on a permanent upload makes no sense
        assert!(validate_upload_form(&form, RetentionPolicy::Permanent).is_err());
        form.ttl_days = None;

        form.metadata = Some("{not json".to_string());
        assert!(validate_upload_form(&form, RetentionPolicy::Temporary).is_err());
        form.metadata = Some(r#"{"origin":"lab"}"#.to_string());
        assert!(validate_upload_form(&form, RetentionPolicy::Temporary).is_ok());
    }

    #[test]
    fn bearer_header_shape() {
        let mut headers = HeaderMap::new();
        assert!(require_bearer(&headers).is_err());
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(require_bearer(&headers).is_err());
        headers.insert(header::AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(require_bearer(&headers).is_err());
        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert!(require_bearer(&headers).is_ok());
    }
}

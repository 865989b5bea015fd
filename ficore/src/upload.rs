use std::sync::Arc;
use std::time::Instant;

use http::StatusCode;
use log::{info, warn};

use fise::element::{Mode, RetentionPolicy};
use fise::seclient::{ElementApi, SeError, SeFileRecord, UploadRequest};

use crate::metrics::{UPLOAD_ATTEMPT_TOTAL, UPLOAD_DURATION};
use crate::reload::ReloadHandle;
use crate::select::{SelectError, SelectedSe, StorageSelector};

#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    /// Nothing satisfied the selection predicate, even after a reload.
    NoAvailable,
    /// Registry and admin both gone; we cannot place anything.
    CoreUnavailable,
    Configuration(String),
    /// Credentials rejected even after a forced refresh.
    Auth,
    /// The element rejected the request for client-side reasons; passed
    /// through untouched.
    ClientRejected(StatusCode),
    /// Final element-side failure after the retry budget was spent.
    Element(SeError),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<&UploadError> for StatusCode {
    fn from(e: &UploadError) -> StatusCode {
        match e {
            UploadError::NoAvailable | UploadError::CoreUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            UploadError::Configuration(_) => StatusCode::BAD_REQUEST,
            UploadError::Auth => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::ClientRejected(s) => *s,
            UploadError::Element(SeError::InsufficientStorage) => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::Element(SeError::Unavailable) => StatusCode::GATEWAY_TIMEOUT,
            UploadError::Element(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub record: SeFileRecord,
    pub element_id: String,
    pub endpoint: String,
    pub mode: Mode,
    pub attempts: u32,
}

/// Drives one logical upload: pick an element, push the bytes, and when the
/// element's answer smells like stale configuration, reload and try exactly
/// one other element.
pub struct UploadCoordinator {
    selector: Arc<StorageSelector>,
    elements: Arc<dyn ElementApi>,
    reload: ReloadHandle,
}

impl UploadCoordinator {
    pub fn new(
        selector: Arc<StorageSelector>,
        elements: Arc<dyn ElementApi>,
        reload: ReloadHandle,
    ) -> Self {
        UploadCoordinator {
            selector,
            elements,
            reload,
        }
    }

    pub async fn upload(
        &self,
        req: &UploadRequest,
        policy: RetentionPolicy,
        target: Option<&str>,
    ) -> Result<UploadOutcome, UploadError> {
        let started = Instant::now();
        let result = self.upload_inner(req, policy, target).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        UPLOAD_DURATION
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn upload_inner(
        &self,
        req: &UploadRequest,
        policy: RetentionPolicy,
        target: Option<&str>,
    ) -> Result<UploadOutcome, UploadError> {
        let selected = match self.selector.select(req.data.len() as u64, policy, target).await {
            Ok(s) => s,
            Err(SelectError::NoAvailable) => {
                // the map may simply be stale; refresh once and retry the
                // selection before giving up
                self.reload.trigger("no_available").await;
                self.selector
                    .select(req.data.len() as u64, policy, target)
                    .await
                    .map_err(map_select)?
            }
            Err(e) => return Err(map_select(e)),
        };

        match self.attempt(&selected, req).await {
            Ok(record) => Ok(UploadOutcome {
                record,
                element_id: selected.element_id,
                endpoint: selected.endpoint,
                mode: selected.mode,
                attempts: 1,
            }),
            Err(e) if e.suggests_stale_config() => {
                let reason = reason_label(&e);
                warn!(
                    "upload to {} failed ({e}), reloading catalogue reason={reason}",
                    selected.element_id
                );
                // the reload completes before the second attempt starts
                self.reload.trigger(reason).await;
                let second = self
                    .selector
                    .select_excluding(
                        req.data.len() as u64,
                        policy,
                        target,
                        &[selected.element_id.as_str()],
                    )
                    .await
                    .map_err(map_select)?;
                info!(
                    "retrying upload on {} after {} failed",
                    second.element_id, selected.element_id
                );
                match self.attempt(&second, req).await {
                    Ok(record) => Ok(UploadOutcome {
                        record,
                        element_id: second.element_id,
                        endpoint: second.endpoint,
                        mode: second.mode,
                        attempts: 2,
                    }),
                    Err(e) => Err(final_error(e)),
                }
            }
            Err(e) => Err(final_error(e)),
        }
    }

    async fn attempt(
        &self,
        selected: &SelectedSe,
        req: &UploadRequest,
    ) -> Result<SeFileRecord, SeError> {
        let result = self.elements.upload(&selected.endpoint, req).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => attempt_label(e),
        };
        UPLOAD_ATTEMPT_TOTAL.with_label_values(&[outcome]).inc();
        result
    }
}

fn map_select(e: SelectError) -> UploadError {
    match e {
        SelectError::NoAvailable => UploadError::NoAvailable,
        SelectError::Configuration(msg) => UploadError::Configuration(msg),
        SelectError::CoreUnavailable => UploadError::CoreUnavailable,
    }
}

fn final_error(e: SeError) -> UploadError {
    match e {
        // the client in seclient already burned its one forced refresh
        SeError::Unauthorized | SeError::Auth(_) => UploadError::Auth,
        SeError::Client(s) => UploadError::ClientRejected(s),
        other => UploadError::Element(other),
    }
}

fn reason_label(e: &SeError) -> &'static str {
    match e {
        SeError::InsufficientStorage => "insufficient_storage",
        SeError::NotFound => "not_found",
        _ => "connect",
    }
}

fn attempt_label(e: &SeError) -> &'static str {
    match e {
        SeError::InsufficientStorage => "insufficient_storage",
        SeError::NotFound => "not_found",
        SeError::Unavailable => "connect",
        SeError::Unauthorized | SeError::Auth(_) => "auth",
        SeError::Client(_) => "client_error",
        SeError::Server(_) => "server_error",
        SeError::InvalidResponse => "invalid_response",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::Reloader;
    use crate::select::SelectorConfig;
    use crate::testutil::{catalogue_entry, fresh_capacity, FakeAdmin, FakeSe, MemRegistry};
    use bytes::Bytes;
    use std::time::Duration;

    const GIB: u64 = 1 << 30;

    struct Rig {
        registry: Arc<MemRegistry>,
        se: Arc<FakeSe>,
        coordinator: UploadCoordinator,
    }

    async fn rig(catalogue: Vec<fise::admin::CatalogueEntry>) -> Rig {
        let registry = Arc::new(MemRegistry::new());
        registry.set_catalogue(catalogue);
        let admin = Arc::new(FakeAdmin::new());
        let reloader = Reloader::new(registry.clone(), admin.clone(), Duration::from_secs(60), true);
        reloader.reload_now("test").await.unwrap();
        let handle = reloader.handle();
        let selector = Arc::new(StorageSelector::new(
            SelectorConfig::default(),
            registry.clone(),
            admin,
            handle.clone(),
        ));
        let se = Arc::new(FakeSe::new());
        let coordinator = UploadCoordinator::new(selector, se.clone(), handle);
        Rig {
            registry,
            se,
            coordinator,
        }
    }

    fn request() -> UploadRequest {
        UploadRequest {
            file_name: "report.bin".to_string(),
            data: Bytes::from_static(b"payload"),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn upload_lands_on_highest_priority_element() {
        let r = rig(vec![
            catalogue_entry("se-a", 100, Mode::Edit),
            catalogue_entry("se-b", 200, Mode::Edit),
        ])
        .await;
        r.registry.seed_capacity(fresh_capacity("se-a", 20 * GIB, 0));
        r.registry.seed_capacity(fresh_capacity("se-b", 20 * GIB, 0));
        r.se
            .push_upload("http://se-a.example:9000", Ok(FakeSe::record("f1", 7)));

        let got = r
            .coordinator
            .upload(&request(), RetentionPolicy::Temporary, None)
            .await
            .unwrap();
        assert_eq!("se-a", got.element_id);
        assert_eq!(1, got.attempts);
        assert_eq!(
            vec!["http://se-a.example:9000"],
            *r.se.upload_log.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn insufficient_storage_reselects_once() {
        // a 507 from the first element moves the upload to the second,
        // exactly two attempts in total
        let r = rig(vec![
            catalogue_entry("se-a", 100, Mode::Edit),
            catalogue_entry("se-b", 200, Mode::Edit),
        ])
        .await;
        r.registry.seed_capacity(fresh_capacity("se-a", 20 * GIB, 0));
        r.registry.seed_capacity(fresh_capacity("se-b", 20 * GIB, 0));
        r.se
            .push_upload("http://se-a.example:9000", Err(SeError::InsufficientStorage));
        r.se
            .push_upload("http://se-b.example:9000", Ok(FakeSe::record("f1", 7)));

        let got = r
            .coordinator
            .upload(&request(), RetentionPolicy::Temporary, None)
            .await
            .unwrap();
        assert_eq!("se-b", got.element_id);
        assert_eq!(2, got.attempts);
        assert_eq!(
            vec!["http://se-a.example:9000", "http://se-b.example:9000"],
            *r.se.upload_log.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn stale_endpoint_404_reselects_once() {
        let r = rig(vec![
            catalogue_entry("se-a", 100, Mode::Edit),
            catalogue_entry("se-b", 200, Mode::Edit),
        ])
        .await;
        r.registry.seed_capacity(fresh_capacity("se-a", 20 * GIB, 0));
        r.registry.seed_capacity(fresh_capacity("se-b", 20 * GIB, 0));
        r.se.push_upload("http://se-a.example:9000", Err(SeError::NotFound));
        r.se
            .push_upload("http://se-b.example:9000", Ok(FakeSe::record("f1", 7)));

        let got = r
            .coordinator
            .upload(&request(), RetentionPolicy::Temporary, None)
            .await
            .unwrap();
        assert_eq!("se-b", got.element_id);
    }

    #[tokio::test]
    async fn server_error_does_not_reselect() {
        let r = rig(vec![
            catalogue_entry("se-a", 100, Mode::Edit),
            catalogue_entry("se-b", 200, Mode::Edit),
        ])
        .await;
        r.registry.seed_capacity(fresh_capacity("se-a", 20 * GIB, 0));
        r.registry.seed_capacity(fresh_capacity("se-b", 20 * GIB, 0));
        r.se.push_upload(
            "http://se-a.example:9000",
            Err(SeError::Server(StatusCode::INTERNAL_SERVER_ERROR)),
        );

        match r
            .coordinator
            .upload(&request(), RetentionPolicy::Temporary, None)
            .await
        {
            Err(UploadError::Element(SeError::Server(_))) => {}
            other => panic!("expected server error, got {other:?}"),
        }
        assert_eq!(1, r.se.upload_log.lock().unwrap().len());
    }

    #[tokio::test]
    async fn client_error_passes_through_without_retry() {
        let r = rig(vec![catalogue_entry("se-a", 100, Mode::Edit)]).await;
        r.registry.seed_capacity(fresh_capacity("se-a", 20 * GIB, 0));
        r.se.push_upload(
            "http://se-a.example:9000",
            Err(SeError::Client(StatusCode::UNSUPPORTED_MEDIA_TYPE)),
        );

        match r
            .coordinator
            .upload(&request(), RetentionPolicy::Temporary, None)
            .await
        {
            Err(UploadError::ClientRejected(s)) => {
                assert_eq!(StatusCode::UNSUPPORTED_MEDIA_TYPE, s)
            }
            other => panic!("expected client rejection, got {other:?}"),
        }
        assert_eq!(1, r.se.upload_log.lock().unwrap().len());
    }

    #[tokio::test]
    async fn no_writable_element_issues_zero_posts() {
        // everything full or unavailable means 503 without a single
        // element POST
        let r = rig(vec![
            catalogue_entry("se-a", 100, Mode::Edit),
            catalogue_entry("se-b", 200, Mode::Rw),
        ])
        .await;
        r.registry
            .seed_capacity(fresh_capacity("se-a", 100 * GIB, 99 * GIB));
        let mut b = fresh_capacity("se-b", 100 * GIB, GIB);
        b.health_status = fise::element::HealthStatus::Unavailable;
        r.registry.seed_capacity(b);

        match r
            .coordinator
            .upload(&request(), RetentionPolicy::Temporary, None)
            .await
        {
            Err(UploadError::NoAvailable) => {}
            other => panic!("expected NoAvailable, got {other:?}"),
        }
        assert!(r.se.upload_log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn two_attempts_is_the_hard_cap() {
        let r = rig(vec![
            catalogue_entry("se-a", 100, Mode::Edit),
            catalogue_entry("se-b", 200, Mode::Edit),
            catalogue_entry("se-c", 300, Mode::Edit),
        ])
        .await;
        for id in ["se-a", "se-b", "se-c"] {
            r.registry.seed_capacity(fresh_capacity(id, 20 * GIB, 0));
        }
        r.se
            .push_upload("http://se-a.example:9000", Err(SeError::InsufficientStorage));
        r.se
            .push_upload("http://se-b.example:9000", Err(SeError::InsufficientStorage));

        match r
            .coordinator
            .upload(&request(), RetentionPolicy::Temporary, None)
            .await
        {
            Err(UploadError::Element(SeError::InsufficientStorage)) => {}
            other => panic!("expected element error, got {other:?}"),
        }
        // se-c is never tried
        assert_eq!(2, r.se.upload_log.lock().unwrap().len());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::from(&UploadError::NoAvailable)
        );
        assert_eq!(
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::from(&UploadError::CoreUnavailable)
        );
        assert_eq!(
            StatusCode::BAD_REQUEST,
            StatusCode::from(&UploadError::Configuration("x".into()))
        );
        assert_eq!(
            StatusCode::GATEWAY_TIMEOUT,
            StatusCode::from(&UploadError::Element(SeError::Unavailable))
        );
        assert_eq!(
            StatusCode::CONFLICT,
            StatusCode::from(&UploadError::ClientRejected(StatusCode::CONFLICT))
        );
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use fise::admin::AdminApi;
use fise::element::{Mode, RetentionPolicy};
use fise::seclient::ElementApi;

use crate::metrics::FINALIZE_TOTAL;
use crate::registry::{RegistryError, RegistryStore};
use crate::reload::ReloadHandle;
use crate::select::{SelectError, StorageSelector};

pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_PHASE_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnState {
    Copying,
    Copied,
    Verifying,
    Completed,
    Failed,
    RolledBack,
}

impl TxnState {
    pub fn progress_percent(&self) -> u8 {
        match self {
            TxnState::Copying => 25,
            TxnState::Copied => 50,
            TxnState::Verifying => 75,
            TxnState::Completed => 100,
            TxnState::Failed | TxnState::RolledBack => 0,
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(
            self,
            TxnState::Completed | TxnState::Failed | TxnState::RolledBack
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxnState::Copying => "copying",
            TxnState::Copied => "copied",
            TxnState::Verifying => "verifying",
            TxnState::Completed => "completed",
            TxnState::Failed => "failed",
            TxnState::RolledBack => "rolled_back",
        }
    }
}

/// The coordination record of one promotion. Persisted to the registry at
/// every transition so a replica crash leaves something recovery can act
/// on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeTransaction {
    pub transaction_id: String,
    pub file_id: String,
    pub source_se_id: String,
    pub target_se_id: String,
    pub state: TxnState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub checksum_verified: bool,
    pub error: Option<String>,
    pub cleanup_scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FinalizeError {
    /// The file is already permanent; there is nothing to promote.
    AlreadyPermanent,
    FileNotFound,
    Configuration(String),
    /// No rw element can take the file right now.
    NoTarget,
    AdminUnavailable,
    RegistryUnavailable,
}

impl std::fmt::Display for FinalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<&FinalizeError> for http::StatusCode {
    fn from(e: &FinalizeError) -> http::StatusCode {
        use http::StatusCode;
        match e {
            FinalizeError::AlreadyPermanent => StatusCode::CONFLICT,
            FinalizeError::FileNotFound => StatusCode::NOT_FOUND,
            FinalizeError::Configuration(_) => StatusCode::BAD_REQUEST,
            FinalizeError::NoTarget
            | FinalizeError::AdminUnavailable
            | FinalizeError::RegistryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<RegistryError> for FinalizeError {
    fn from(_e: RegistryError) -> Self {
        FinalizeError::RegistryUnavailable
    }
}

#[derive(Clone)]
pub struct FinalizeConfig {
    pub safety_margin: Duration,
    pub phase_max_attempts: u32,
    pub phase_backoff: Duration,
    pub recovery_timeout: Duration,
    pub gc_interval: Duration,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        FinalizeConfig {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            phase_max_attempts: DEFAULT_PHASE_MAX_ATTEMPTS,
            phase_backoff: Duration::from_millis(500),
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            gc_interval: DEFAULT_GC_INTERVAL,
        }
    }
}

fn new_transaction_id() -> String {
    format!("txn-{:016x}", rand::random::<u64>())
}

/// Two-phase promotion of a temporary file on an edit element to a
/// permanent file on a rw element.
///
/// Phase one copies the bytes source-to-target; verification compares
/// SHA-256 digests on both sides; phase two points the admin registry at
/// the target. The source copy is never deleted in-band: the sweeper picks
/// it up once the safety margin has passed.
///
/// Clone is shallow (everything inside is shared) so submit can hand a
/// copy of itself to the background task driving the phases.
#[derive(Clone)]
pub struct FinalizeCoordinator {
    config: FinalizeConfig,
    registry: Arc<dyn RegistryStore>,
    admin: Arc<dyn AdminApi>,
    elements: Arc<dyn ElementApi>,
    selector: Arc<StorageSelector>,
    map: ReloadHandle,
}

impl FinalizeCoordinator {
    pub fn new(
        config: FinalizeConfig,
        registry: Arc<dyn RegistryStore>,
        admin: Arc<dyn AdminApi>,
        elements: Arc<dyn ElementApi>,
        selector: Arc<StorageSelector>,
        map: ReloadHandle,
    ) -> Self {
        FinalizeCoordinator {
            config,
            registry,
            admin,
            elements,
            selector,
            map,
        }
    }

    /// Accept a finalize request: validate, record the transaction in state
    /// copying, and drive the phases in the background. Submitting a file
    /// that already has an in-flight transaction returns that transaction
    /// instead of starting a second one.
    pub async fn submit(
        &self,
        file_id: &str,
        target: Option<&str>,
    ) -> Result<FinalizeTransaction, FinalizeError> {
        if let Some(existing) = self.active_txn_for_file(file_id).await? {
            info!(
                "finalize of {file_id} already running as {}",
                existing.transaction_id
            );
            return Ok(existing);
        }
        let txn = self.prepare(file_id, target).await?;
        let this = self.clone();
        let spawned = txn.clone();
        tokio::spawn(async move {
            this.drive(spawned).await;
        });
        Ok(txn)
    }

    pub async fn get_status(
        &self,
        transaction_id: &str,
    ) -> Result<Option<FinalizeTransaction>, FinalizeError> {
        Ok(self.registry.txn_get(transaction_id).await?)
    }

    async fn active_txn_for_file(
        &self,
        file_id: &str,
    ) -> Result<Option<FinalizeTransaction>, FinalizeError> {
        let txns = self.registry.txn_list().await?;
        Ok(txns
            .into_iter()
            .find(|t| t.file_id == file_id && !t.state.terminal()))
    }

    async fn prepare(
        &self,
        file_id: &str,
        target: Option<&str>,
    ) -> Result<FinalizeTransaction, FinalizeError> {
        let record = self.admin.get_file(file_id).await.map_err(|e| match e {
            fise::admin::AdminError::NotFound => FinalizeError::FileNotFound,
            _ => FinalizeError::AdminUnavailable,
        })?;
        if record.retention_policy != RetentionPolicy::Temporary {
            return Err(FinalizeError::AlreadyPermanent);
        }

        let snapshot = self.map.snapshot();
        if !snapshot.contains_key(&record.storage_element_id) {
            return Err(FinalizeError::Configuration(format!(
                "source element {} is not in the catalogue",
                record.storage_element_id
            )));
        }

        let target_se_id = match target {
            Some(id) => {
                let info = snapshot.get(id).ok_or_else(|| {
                    FinalizeError::Configuration(format!("target element {id} is not in the catalogue"))
                })?;
                if info.mode != Mode::Rw {
                    return Err(FinalizeError::Configuration(format!(
                        "target element {id} has mode {}, finalize needs rw",
                        info.mode
                    )));
                }
                id.to_string()
            }
            None => {
                let selected = self
                    .selector
                    .select(record.file_size, RetentionPolicy::Permanent, None)
                    .await
                    .map_err(|e| match e {
                        SelectError::NoAvailable => FinalizeError::NoTarget,
                        SelectError::CoreUnavailable => FinalizeError::RegistryUnavailable,
                        SelectError::Configuration(msg) => FinalizeError::Configuration(msg),
                    })?;
                selected.element_id
            }
        };

        let txn = FinalizeTransaction {
            transaction_id: new_transaction_id(),
            file_id: file_id.to_string(),
            source_se_id: record.storage_element_id,
            target_se_id,
            state: TxnState::Copying,
            created_at: Utc::now(),
            completed_at: None,
            checksum_verified: false,
            error: None,
            cleanup_scheduled_at: None,
        };
        self.registry.txn_put(&txn).await?;
        info!(
            "finalize {} accepted: {} from {} to {}",
            txn.transaction_id, txn.file_id, txn.source_se_id, txn.target_se_id
        );
        Ok(txn)
    }

    async fn drive(&self, mut txn: FinalizeTransaction) {
        let snapshot = self.map.snapshot();
        let Some(source) = snapshot.get(&txn.source_se_id).cloned() else {
            self.fail(txn, "source element vanished from the catalogue", false)
                .await;
            return;
        };
        let Some(target) = snapshot.get(&txn.target_se_id).cloned() else {
            self.fail(txn, "target element vanished from the catalogue", false)
                .await;
            return;
        };

        // phase one: source pushes its bytes to the target
        let copy = self
            .retry_phase("copy", || {
                self.elements
                    .copy_to(&source.endpoint, &txn.file_id, &target.endpoint)
            })
            .await;
        if let Err(e) = copy {
            // an endpoint that 404s or refuses connections suggests the
            // catalogue moved under us
            if e.suggests_stale_config() {
                self.map.trigger("finalize").await;
            }
            // a partial copy may be sitting on the target
            self.fail(txn, &format!("copy failed: {e}"), true).await;
            return;
        }
        txn.state = TxnState::Copied;
        self.persist(&txn).await;

        // verification: both sides must agree on the digest
        txn.state = TxnState::Verifying;
        self.persist(&txn).await;
        let digests = self
            .retry_phase("verify", || {
                let elements = self.elements.clone();
                let source_endpoint = source.endpoint.clone();
                let target_endpoint = target.endpoint.clone();
                let file_id = txn.file_id.clone();
                async move {
                    let src = elements.digest(&source_endpoint, &file_id).await?;
                    let tgt = elements.digest(&target_endpoint, &file_id).await?;
                    Ok::<_, fise::seclient::SeError>((src, tgt))
                }
            })
            .await;
        let (src, tgt) = match digests {
            Ok(pair) => pair,
            Err(e) => {
                if e.suggests_stale_config() {
                    self.map.trigger("finalize").await;
                }
                self.fail(txn, &format!("verify failed: {e}"), true).await;
                return;
            }
        };
        if src.algorithm != tgt.algorithm || src.digest != tgt.digest {
            let msg = format!(
                "digest mismatch: source {}:{} target {}:{}",
                src.algorithm, src.digest, tgt.algorithm, tgt.digest
            );
            self.fail(txn, &msg, true).await;
            return;
        }
        txn.checksum_verified = true;

        // phase two: flip the authoritative pointer. After this returns Ok
        // the transaction can no longer be rolled back.
        let commit = self
            .retry_phase("commit", || {
                self.admin
                    .commit_file_location(&txn.file_id, &txn.target_se_id)
            })
            .await;
        if let Err(e) = commit {
            self.fail(txn, &format!("commit failed: {e}"), true).await;
            return;
        }

        let now = Utc::now();
        txn.state = TxnState::Completed;
        txn.completed_at = Some(now);
        txn.cleanup_scheduled_at =
            Some(now + chrono::Duration::from_std(self.config.safety_margin).unwrap());
        self.persist(&txn).await;
        FINALIZE_TOTAL.with_label_values(&["completed"]).inc();
        info!(
            "finalize {} completed: {} now lives on {}",
            txn.transaction_id, txn.file_id, txn.target_se_id
        );
    }

    /// Mark failed, compensate, mark rolled back. Compensation is deleting
    /// whatever landed on the target; its failure is logged and ignored so
    /// the transaction still reaches its terminal state. Repeated sweeps of
    /// rolled-back transactions converge on zero leftovers.
    async fn fail(&self, mut txn: FinalizeTransaction, msg: &str, delete_target: bool) {
        warn!("finalize {} failed: {msg}", txn.transaction_id);
        txn.state = TxnState::Failed;
        txn.error = Some(msg.to_string());
        self.persist(&txn).await;
        FINALIZE_TOTAL.with_label_values(&["failed"]).inc();

        if delete_target {
            let snapshot = self.map.snapshot();
            if let Some(target) = snapshot.get(&txn.target_se_id) {
                if let Err(e) = self.elements.delete(&target.endpoint, &txn.file_id).await {
                    error!(
                        "finalize {} could not remove target copy: {e}",
                        txn.transaction_id
                    );
                }
            }
        }

        txn.state = TxnState::RolledBack;
        self.persist(&txn).await;
        FINALIZE_TOTAL.with_label_values(&["rolled_back"]).inc();
    }

    // a lost persist is logged, not fatal: the worst case is recovery
    // re-doing work that already happened, and every step is idempotent
    async fn persist(&self, txn: &FinalizeTransaction) {
        if let Err(e) = self.registry.txn_put(txn).await {
            error!(
                "could not persist transaction {} in state {}: {e}",
                txn.transaction_id,
                txn.state.as_str()
            );
        }
    }

    /// Run one phase up to phase_max_attempts times with exponential
    /// backoff, handing back the last error for the caller to classify.
    async fn retry_phase<T, E, F, Fut>(&self, what: &str, mut f: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let attempts = self.config.phase_max_attempts.max(1);
        let mut delay = self.config.phase_backoff;
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!("{what} attempt {attempt}/{attempts} failed: {e}");
                    if attempt >= attempts {
                        return Err(e);
                    }
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    /// Re-examine persisted transactions after a restart. Anything still
    /// non-terminal past the recovery timeout is treated as orphaned by a
    /// crashed replica: failed and compensated. Completed transactions are
    /// left for the sweeper.
    pub async fn recover(&self) -> Result<(), FinalizeError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.recovery_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let txns = self.registry.txn_list().await?;
        for txn in txns {
            if !txn.state.terminal() && txn.created_at < cutoff {
                warn!(
                    "recovering orphaned transaction {} (state {}, created {})",
                    txn.transaction_id,
                    txn.state.as_str(),
                    txn.created_at
                );
                self.fail(txn, "abandoned by a crashed replica", true).await;
            }
        }
        Ok(())
    }

    /// One sweeper pass: delete source copies of completed transactions
    /// whose safety margin has elapsed, then drop the record. Old
    /// rolled-back records are dropped once they are only of archaeological
    /// interest.
    pub async fn sweep_once(&self) -> Result<(), FinalizeError> {
        let now = Utc::now();
        let margin = chrono::Duration::from_std(self.config.safety_margin)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        let snapshot = self.map.snapshot();
        for txn in self.registry.txn_list().await? {
            match txn.state {
                TxnState::Completed => {
                    let due = txn.cleanup_scheduled_at.map(|at| now >= at).unwrap_or(false);
                    if !due {
                        continue;
                    }
                    let Some(source) = snapshot.get(&txn.source_se_id) else {
                        // catalogue no longer knows the source; nothing left
                        // to delete there
                        self.registry.txn_delete(&txn.transaction_id).await?;
                        continue;
                    };
                    match self.elements.delete(&source.endpoint, &txn.file_id).await {
                        Ok(()) => {
                            info!(
                                "sweeper removed source copy of {} from {}",
                                txn.file_id, txn.source_se_id
                            );
                            self.registry.txn_delete(&txn.transaction_id).await?;
                        }
                        Err(e) => {
                            // delete is idempotent; keep the record and try
                            // again next pass
                            warn!(
                                "sweeper could not remove {} from {}: {e}",
                                txn.file_id, txn.source_se_id
                            );
                        }
                    }
                }
                TxnState::Failed | TxnState::RolledBack => {
                    if now.signed_duration_since(txn.created_at) > margin {
                        self.registry.txn_delete(&txn.transaction_id).await?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub async fn run_gc(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.gc_interval) => {}
                _ = shutdown.changed() => {
                    info!("finalize sweeper stopping");
                    return;
                }
            }
            if let Err(e) = self.sweep_once().await {
                warn!("sweeper pass failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::Reloader;
    use crate::select::SelectorConfig;
    use crate::testutil::{catalogue_entry, fresh_capacity, FakeAdmin, FakeSe, MemRegistry};
    use fise::admin::FileRecord;
    use fise::seclient::SeError;

    const GIB: u64 = 1 << 30;
    const SHA_A: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const SHA_B: &str = "deadbeef8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    struct Rig {
        registry: Arc<MemRegistry>,
        admin: Arc<FakeAdmin>,
        se: Arc<FakeSe>,
        coordinator: Arc<FinalizeCoordinator>,
    }

    async fn rig(config: FinalizeConfig) -> Rig {
        let registry = Arc::new(MemRegistry::new());
        registry.set_catalogue(vec![
            catalogue_entry("se-a", 100, Mode::Edit),
            catalogue_entry("se-b", 200, Mode::Rw),
            catalogue_entry("se-c", 300, Mode::Rw),
        ]);
        registry.seed_capacity(fresh_capacity("se-b", 20 * GIB, 0));
        registry.seed_capacity(fresh_capacity("se-c", 20 * GIB, 0));
        let admin = Arc::new(FakeAdmin::new());
        admin.files.lock().unwrap().insert(
            "f1".to_string(),
            FileRecord {
                file_id: "f1".to_string(),
                retention_policy: RetentionPolicy::Temporary,
                storage_element_id: "se-a".to_string(),
                file_size: 1 << 20,
                checksum: Some(SHA_A.to_string()),
            },
        );
        let reloader = Reloader::new(registry.clone(), admin.clone(), Duration::from_secs(60), true);
        reloader.reload_now("test").await.unwrap();
        let handle = reloader.handle();
        let selector = Arc::new(StorageSelector::new(
            SelectorConfig::default(),
            registry.clone(),
            admin.clone(),
            handle.clone(),
        ));
        let se = Arc::new(FakeSe::new());
        let coordinator = Arc::new(FinalizeCoordinator::new(
            config,
            registry.clone(),
            admin.clone(),
            se.clone(),
            selector,
            handle,
        ));
        Rig {
            registry,
            admin,
            se,
            coordinator,
        }
    }

    fn fast_config() -> FinalizeConfig {
        FinalizeConfig {
            phase_backoff: Duration::from_millis(1),
            ..FinalizeConfig::default()
        }
    }

    #[tokio::test]
    async fn happy_path_runs_both_phases_and_schedules_cleanup() {
        let r = rig(fast_config()).await;
        r.se.set_digest("http://se-a.example:9000", "f1", SHA_A);
        r.se.set_digest("http://se-b.example:9000", "f1", SHA_A);

        let txn = r.coordinator.prepare("f1", None).await.unwrap();
        assert_eq!(TxnState::Copying, txn.state);
        assert_eq!(25, txn.state.progress_percent());
        assert_eq!("se-a", txn.source_se_id);
        // se-b is the highest priority rw element
        assert_eq!("se-b", txn.target_se_id);

        r.coordinator.drive(txn.clone()).await;

        let done = r
            .coordinator
            .get_status(&txn.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(TxnState::Completed, done.state);
        assert_eq!(100, done.state.progress_percent());
        assert!(done.checksum_verified);
        let completed_at = done.completed_at.unwrap();
        let cleanup_at = done.cleanup_scheduled_at.unwrap();
        assert!(cleanup_at >= completed_at + chrono::Duration::hours(24));

        // the copy was commanded source to target
        assert_eq!(
            vec![(
                "http://se-a.example:9000".to_string(),
                "f1".to_string(),
                "http://se-b.example:9000".to_string()
            )],
            *r.se.copy_log.lock().unwrap()
        );
        // the authoritative pointer moved
        assert_eq!(
            vec![("f1".to_string(), "se-b".to_string())],
            *r.admin.committed.lock().unwrap()
        );
        // the source copy is untouched until the sweeper comes around
        assert!(r.se.delete_log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn digest_mismatch_rolls_back_and_purges_target() {
        let r = rig(fast_config()).await;
        r.se.set_digest("http://se-a.example:9000", "f1", SHA_A);
        r.se.set_digest("http://se-b.example:9000", "f1", SHA_B);

        let txn = r.coordinator.prepare("f1", None).await.unwrap();
        r.coordinator.drive(txn.clone()).await;

        let done = r
            .coordinator
            .get_status(&txn.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(TxnState::RolledBack, done.state);
        assert_eq!(0, done.state.progress_percent());
        assert!(!done.checksum_verified);
        assert!(done.error.as_deref().unwrap().contains("digest mismatch"));
        // the target copy was compensated away, the source kept
        assert_eq!(
            vec![("http://se-b.example:9000".to_string(), "f1".to_string())],
            *r.se.delete_log.lock().unwrap()
        );
        // nothing was committed
        assert!(r.admin.committed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn copy_failure_exhausts_retries_then_rolls_back() {
        let r = rig(fast_config()).await;
        r.se.copy_results
            .lock()
            .unwrap()
            .insert("http://se-a.example:9000".to_string(), Err(SeError::Unavailable));

        let txn = r.coordinator.prepare("f1", None).await.unwrap();
        r.coordinator.drive(txn.clone()).await;

        let done = r
            .coordinator
            .get_status(&txn.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(TxnState::RolledBack, done.state);
        assert_eq!(
            DEFAULT_PHASE_MAX_ATTEMPTS as usize,
            r.se.copy_log.lock().unwrap().len()
        );
    }

    #[tokio::test]
    async fn already_permanent_file_is_rejected() {
        let r = rig(fast_config()).await;
        r.admin.files.lock().unwrap().insert(
            "f2".to_string(),
            FileRecord {
                file_id: "f2".to_string(),
                retention_policy: RetentionPolicy::Permanent,
                storage_element_id: "se-b".to_string(),
                file_size: 1024,
                checksum: None,
            },
        );
        match r.coordinator.prepare("f2", None).await {
            Err(FinalizeError::AlreadyPermanent) => {}
            other => panic!("expected AlreadyPermanent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_file_is_not_found() {
        let r = rig(fast_config()).await;
        match r.coordinator.prepare("nope", None).await {
            Err(FinalizeError::FileNotFound) => {}
            other => panic!("expected FileNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pinned_target_must_be_rw() {
        let r = rig(fast_config()).await;
        match r.coordinator.prepare("f1", Some("se-a")).await {
            Err(FinalizeError::Configuration(_)) => {}
            other => panic!("expected Configuration, got {other:?}"),
        }
        let txn = r.coordinator.prepare("f1", Some("se-c")).await.unwrap();
        assert_eq!("se-c", txn.target_se_id);
    }

    #[tokio::test]
    async fn submit_returns_the_active_transaction_for_the_same_file() {
        let r = rig(fast_config()).await;
        let first = r.coordinator.prepare("f1", None).await.unwrap();
        // still in state copying; a second submit must not fork a second
        // transaction
        let second = r.coordinator.submit("f1", None).await.unwrap();
        assert_eq!(first.transaction_id, second.transaction_id);
    }

    #[tokio::test]
    async fn recovery_fails_orphaned_transactions() {
        let r = rig(fast_config()).await;
        let mut txn = r.coordinator.prepare("f1", None).await.unwrap();
        txn.created_at = Utc::now() - chrono::Duration::hours(2);
        r.registry.txn_put(&txn).await.unwrap();

        r.coordinator.recover().await.unwrap();
        let done = r
            .coordinator
            .get_status(&txn.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(TxnState::RolledBack, done.state);
    }

    #[tokio::test]
    async fn recovery_leaves_recent_and_completed_transactions_alone() {
        let r = rig(fast_config()).await;
        r.se.set_digest("http://se-a.example:9000", "f1", SHA_A);
        r.se.set_digest("http://se-b.example:9000", "f1", SHA_A);
        let active = r.coordinator.prepare("f1", None).await.unwrap();

        let completed = FinalizeTransaction {
            transaction_id: "txn-done".to_string(),
            file_id: "f9".to_string(),
            source_se_id: "se-a".to_string(),
            target_se_id: "se-b".to_string(),
            state: TxnState::Completed,
            created_at: Utc::now() - chrono::Duration::days(2),
            completed_at: Some(Utc::now() - chrono::Duration::days(2)),
            checksum_verified: true,
            error: None,
            cleanup_scheduled_at: Some(Utc::now() - chrono::Duration::days(1)),
        };
        r.registry.txn_put(&completed).await.unwrap();

        r.coordinator.recover().await.unwrap();
        assert_eq!(
            TxnState::Copying,
            r.coordinator
                .get_status(&active.transaction_id)
                .await
                .unwrap()
                .unwrap()
                .state
        );
        assert_eq!(
            TxnState::Completed,
            r.coordinator
                .get_status("txn-done")
                .await
                .unwrap()
                .unwrap()
                .state
        );
    }

    #[tokio::test]
    async fn sweeper_deletes_source_after_safety_margin() {
        let r = rig(fast_config()).await;
        let txn = FinalizeTransaction {
            transaction_id: "txn-due".to_string(),
            file_id: "f1".to_string(),
            source_se_id: "se-a".to_string(),
            target_se_id: "se-b".to_string(),
            state: TxnState::Completed,
            created_at: Utc::now() - chrono::Duration::days(2),
            completed_at: Some(Utc::now() - chrono::Duration::days(2)),
            checksum_verified: true,
            error: None,
            cleanup_scheduled_at: Some(Utc::now() - chrono::Duration::hours(1)),
        };
        r.registry.txn_put(&txn).await.unwrap();

        r.coordinator.sweep_once().await.unwrap();
        assert_eq!(
            vec![("http://se-a.example:9000".to_string(), "f1".to_string())],
            *r.se.delete_log.lock().unwrap()
        );
        assert!(r.registry.txn_get("txn-due").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweeper_keeps_record_until_delete_succeeds() {
        let r = rig(fast_config()).await;
        let txn = FinalizeTransaction {
            transaction_id: "txn-due".to_string(),
            file_id: "f1".to_string(),
            source_se_id: "se-a".to_string(),
            target_se_id: "se-b".to_string(),
            state: TxnState::Completed,
            created_at: Utc::now() - chrono::Duration::days(2),
            completed_at: Some(Utc::now() - chrono::Duration::days(2)),
            checksum_verified: true,
            error: None,
            cleanup_scheduled_at: Some(Utc::now() - chrono::Duration::hours(1)),
        };
        r.registry.txn_put(&txn).await.unwrap();
        r.se.delete_fail_once
            .lock()
            .unwrap()
            .insert("http://se-a.example:9000".to_string(), 1);

        r.coordinator.sweep_once().await.unwrap();
        // first pass failed, record retained
        assert!(r.registry.txn_get("txn-due").await.unwrap().is_some());

        r.coordinator.sweep_once().await.unwrap();
        assert!(r.registry.txn_get("txn-due").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sweeper_ignores_transactions_before_their_margin() {
        let r = rig(fast_config()).await;
        let txn = FinalizeTransaction {
            transaction_id: "txn-early".to_string(),
            file_id: "f1".to_string(),
            source_se_id: "se-a".to_string(),
            target_se_id: "se-b".to_string(),
            state: TxnState::Completed,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
            checksum_verified: true,
            error: None,
            cleanup_scheduled_at: Some(Utc::now() + chrono::Duration::hours(24)),
        };
        r.registry.txn_put(&txn).await.unwrap();

        r.coordinator.sweep_once().await.unwrap();
        assert!(r.se.delete_log.lock().unwrap().is_empty());
        assert!(r.registry.txn_get("txn-early").await.unwrap().is_some());
    }

    #[test]
    fn progress_mapping_matches_protocol() {
        assert_eq!(25, TxnState::Copying.progress_percent());
        assert_eq!(50, TxnState::Copied.progress_percent());
        assert_eq!(75, TxnState::Verifying.progress_percent());
        assert_eq!(100, TxnState::Completed.progress_percent());
        assert_eq!(0, TxnState::Failed.progress_percent());
        assert_eq!(0, TxnState::RolledBack.progress_percent());
    }

    #[test]
    fn txn_state_serializes_snake_case() {
        assert_eq!(
            "\"rolled_back\"",
            serde_json::to_string(&TxnState::RolledBack).unwrap()
        );
        assert_eq!(
            TxnState::Copying,
            serde_json::from_str::<TxnState>("\"copying\"").unwrap()
        );
    }
}

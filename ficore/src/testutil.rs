//! In-memory fakes for the capability traits. Test-only.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fise::admin::{AdminApi, AdminError, CatalogueEntry, FileRecord};
use fise::element::{CapacityEntry, HealthEntry, Mode};
use fise::seclient::{
    CapacityProbe, DigestResponse, ElementApi, SeError, SeFileRecord, UploadRequest,
};

use crate::finalize::FinalizeTransaction;
use crate::registry::{CapacityLookup, RegistryError, RegistryStore};

#[derive(Default)]
struct MemState {
    capacity: HashMap<String, CapacityEntry>,
    health: HashMap<String, HealthEntry>,
    available: HashMap<Mode, BTreeMap<(i64, String), ()>>,
    catalogue: Option<Vec<CatalogueEntry>>,
    leader: Option<(String, DateTime<Utc>)>,
    txns: HashMap<String, FinalizeTransaction>,
}

pub(crate) struct MemRegistry {
    state: StdMutex<MemState>,
    max_stale: Duration,
    pub(crate) fail: AtomicBool,
}

impl MemRegistry {
    pub(crate) fn new() -> Self {
        MemRegistry {
            state: StdMutex::new(MemState::default()),
            max_stale: Duration::from_secs(90),
            fail: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_catalogue(&self, entries: Vec<CatalogueEntry>) {
        self.state.lock().unwrap().catalogue = Some(entries);
    }

    pub(crate) fn seed_capacity(&self, entry: CapacityEntry) {
        self.state
            .lock()
            .unwrap()
            .capacity
            .insert(entry.element_id.clone(), entry);
    }

    pub(crate) fn capacity_of(&self, element_id: &str) -> Option<CapacityEntry> {
        self.state.lock().unwrap().capacity.get(element_id).cloned()
    }

    pub(crate) fn health_of(&self, element_id: &str) -> Option<HealthEntry> {
        self.state.lock().unwrap().health.get(element_id).cloned()
    }

    pub(crate) fn members(&self, mode: Mode) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .available
            .get(&mode)
            .map(|set| set.keys().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn leader_holder(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .leader
            .as_ref()
            .filter(|(_, expires)| *expires > Utc::now())
            .map(|(id, _)| id.clone())
    }

    fn check(&self) -> Result<(), RegistryError> {
        if self.fail.load(Ordering::Relaxed) {
            Err(RegistryError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RegistryStore for MemRegistry {
    async fn ping(&self) -> bool {
        !self.fail.load(Ordering::Relaxed)
    }

    async fn get_capacity(&self, element_id: &str) -> Result<CapacityLookup, RegistryError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        match state.capacity.get(element_id) {
            Some(entry) => {
                let age = Utc::now().signed_duration_since(entry.last_updated);
                if age.to_std().map(|a| a > self.max_stale).unwrap_or(false) {
                    Ok(CapacityLookup::Stale(entry.clone()))
                } else {
                    Ok(CapacityLookup::Fresh(entry.clone()))
                }
            }
            None => Ok(CapacityLookup::Missing),
        }
    }

    async fn put_capacity(&self, entry: &CapacityEntry) -> Result<(), RegistryError> {
        self.check()?;
        self.seed_capacity(entry.clone());
        Ok(())
    }

    async fn delete_capacity(&self, element_id: &str) -> Result<(), RegistryError> {
        self.check()?;
        self.state.lock().unwrap().capacity.remove(element_id);
        Ok(())
    }

    async fn put_health(&self, entry: &HealthEntry) -> Result<(), RegistryError> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .health
            .insert(entry.element_id.clone(), entry.clone());
        Ok(())
    }

    async fn delete_health(&self, element_id: &str) -> Result<(), RegistryError> {
        self.check()?;
        self.state.lock().unwrap().health.remove(element_id);
        Ok(())
    }

    async fn add_available(
        &self,
        mode: Mode,
        element_id: &str,
        priority: i64,
    ) -> Result<(), RegistryError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let set = state.available.entry(mode).or_default();
        set.retain(|(_, id), _| id != element_id);
        set.insert((priority, element_id.to_string()), ());
        Ok(())
    }

    async fn remove_available(&self, mode: Mode, element_id: &str) -> Result<(), RegistryError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if let Some(set) = state.available.get_mut(&mode) {
            set.retain(|(_, id), _| id != element_id);
        }
        Ok(())
    }

    async fn list_by_priority(&self, mode: Mode) -> Result<Vec<String>, RegistryError> {
        self.check()?;
        Ok(self.members(mode))
    }

    async fn apply_observation(
        &self,
        entry: &CapacityEntry,
        mode: Mode,
        priority: i64,
        member: bool,
    ) -> Result<(), RegistryError> {
        self.put_capacity(entry).await?;
        self.put_health(&HealthEntry {
            element_id: entry.element_id.clone(),
            health_status: entry.health_status,
            last_updated: entry.last_updated,
        })
        .await?;
        if member {
            self.add_available(mode, &entry.element_id, priority).await
        } else {
            self.remove_available(mode, &entry.element_id).await
        }
    }

    async fn purge_element(&self, element_id: &str) -> Result<(), RegistryError> {
        self.delete_capacity(element_id).await?;
        self.delete_health(element_id).await?;
        for mode in [Mode::Edit, Mode::Rw] {
            self.remove_available(mode, element_id).await?;
        }
        Ok(())
    }

    async fn load_catalogue(&self) -> Result<Option<Vec<CatalogueEntry>>, RegistryError> {
        self.check()?;
        Ok(self.state.lock().unwrap().catalogue.clone())
    }

    async fn acquire_leader(&self, replica_id: &str, ttl: Duration) -> Result<bool, RegistryError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let held = state
            .leader
            .as_ref()
            .map(|(_, expires)| *expires > now)
            .unwrap_or(false);
        if held {
            return Ok(false);
        }
        state.leader = Some((
            replica_id.to_string(),
            now + chrono::Duration::from_std(ttl).unwrap(),
        ));
        Ok(true)
    }

    async fn renew_leader(&self, replica_id: &str, ttl: Duration) -> Result<bool, RegistryError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        match &state.leader {
            Some((holder, expires)) if holder == replica_id && *expires > now => {
                state.leader = Some((
                    replica_id.to_string(),
                    now + chrono::Duration::from_std(ttl).unwrap(),
                ));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_leader(&self, replica_id: &str) -> Result<(), RegistryError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if let Some((holder, _)) = &state.leader {
            if holder == replica_id {
                state.leader = None;
            }
        }
        Ok(())
    }

    async fn txn_put(&self, txn: &FinalizeTransaction) -> Result<(), RegistryError> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .txns
            .insert(txn.transaction_id.clone(), txn.clone());
        Ok(())
    }

    async fn txn_get(
        &self,
        transaction_id: &str,
    ) -> Result<Option<FinalizeTransaction>, RegistryError> {
        self.check()?;
        Ok(self.state.lock().unwrap().txns.get(transaction_id).cloned())
    }

    async fn txn_list(&self) -> Result<Vec<FinalizeTransaction>, RegistryError> {
        self.check()?;
        Ok(self.state.lock().unwrap().txns.values().cloned().collect())
    }

    async fn txn_delete(&self, transaction_id: &str) -> Result<(), RegistryError> {
        self.check()?;
        self.state.lock().unwrap().txns.remove(transaction_id);
        Ok(())
    }
}

/// Scripted element fleet keyed by endpoint.
#[derive(Default)]
pub(crate) struct FakeSe {
    pub(crate) capacities: StdMutex<HashMap<String, Result<(u64, u64), SeError>>>,
    pub(crate) upload_results: StdMutex<HashMap<String, VecDeque<Result<SeFileRecord, SeError>>>>,
    pub(crate) upload_log: StdMutex<Vec<String>>,
    pub(crate) copy_results: StdMutex<HashMap<String, Result<(), SeError>>>,
    pub(crate) copy_log: StdMutex<Vec<(String, String, String)>>,
    pub(crate) digests: StdMutex<HashMap<(String, String), String>>,
    pub(crate) delete_log: StdMutex<Vec<(String, String)>>,
    pub(crate) delete_fail_once: StdMutex<HashMap<String, u32>>,
}

impl FakeSe {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_capacity(&self, endpoint: &str, total: u64, used: u64) {
        self.capacities
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), Ok((total, used)));
    }

    pub(crate) fn set_capacity_error(&self, endpoint: &str, err: SeError) {
        self.capacities
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), Err(err));
    }

    pub(crate) fn push_upload(&self, endpoint: &str, result: Result<SeFileRecord, SeError>) {
        self.upload_results
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(result);
    }

    pub(crate) fn set_digest(&self, endpoint: &str, file_id: &str, digest: &str) {
        self.digests
            .lock()
            .unwrap()
            .insert((endpoint.to_string(), file_id.to_string()), digest.to_string());
    }

    pub(crate) fn record(file_id: &str, size: u64) -> SeFileRecord {
        SeFileRecord {
            file_id: file_id.to_string(),
            storage_filename: format!("{file_id}.bin"),
            file_size: size,
            checksum: "0000".to_string(),
        }
    }
}

#[async_trait]
impl ElementApi for FakeSe {
    async fn capacity(&self, endpoint: &str) -> Result<CapacityProbe, SeError> {
        match self.capacities.lock().unwrap().get(endpoint) {
            Some(Ok((total, used))) => Ok(CapacityProbe {
                capacity_total: *total,
                capacity_used: *used,
                capacity_free: None,
                capacity_percent: None,
                health_status: None,
            }),
            Some(Err(e)) => Err(e.clone()),
            None => Err(SeError::Unavailable),
        }
    }

    async fn upload(&self, endpoint: &str, _req: &UploadRequest) -> Result<SeFileRecord, SeError> {
        self.upload_log.lock().unwrap().push(endpoint.to_string());
        self.upload_results
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(|q| q.pop_front())
            .unwrap_or(Err(SeError::Unavailable))
    }

    async fn copy_to(
        &self,
        source_endpoint: &str,
        file_id: &str,
        target_endpoint: &str,
    ) -> Result<(), SeError> {
        self.copy_log.lock().unwrap().push((
            source_endpoint.to_string(),
            file_id.to_string(),
            target_endpoint.to_string(),
        ));
        self.copy_results
            .lock()
            .unwrap()
            .get(source_endpoint)
            .cloned()
            .unwrap_or(Ok(()))
    }

    async fn digest(&self, endpoint: &str, file_id: &str) -> Result<DigestResponse, SeError> {
        match self
            .digests
            .lock()
            .unwrap()
            .get(&(endpoint.to_string(), file_id.to_string()))
        {
            Some(digest) => Ok(DigestResponse {
                algorithm: "sha256".to_string(),
                digest: digest.clone(),
            }),
            None => Err(SeError::NotFound),
        }
    }

    async fn delete(&self, endpoint: &str, file_id: &str) -> Result<(), SeError> {
        let mut fails = self.delete_fail_once.lock().unwrap();
        if let Some(n) = fails.get_mut(endpoint) {
            if *n > 0 {
                *n -= 1;
                return Err(SeError::Unavailable);
            }
        }
        drop(fails);
        self.delete_log
            .lock()
            .unwrap()
            .push((endpoint.to_string(), file_id.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeAdmin {
    pub(crate) catalogue: StdMutex<Vec<CatalogueEntry>>,
    pub(crate) capacities: StdMutex<HashMap<String, CapacityEntry>>,
    pub(crate) files: StdMutex<HashMap<String, FileRecord>>,
    pub(crate) committed: StdMutex<Vec<(String, String)>>,
    pub(crate) fail: AtomicBool,
}

impl FakeAdmin {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn check(&self) -> Result<(), AdminError> {
        if self.fail.load(Ordering::Relaxed) {
            Err(AdminError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AdminApi for FakeAdmin {
    async fn list_available_elements(&self) -> Result<Vec<CatalogueEntry>, AdminError> {
        self.check()?;
        Ok(self.catalogue.lock().unwrap().clone())
    }

    async fn get_capacity(&self, element_id: &str) -> Result<CapacityEntry, AdminError> {
        self.check()?;
        self.capacities
            .lock()
            .unwrap()
            .get(element_id)
            .cloned()
            .ok_or(AdminError::NotFound)
    }

    async fn get_file(&self, file_id: &str) -> Result<FileRecord, AdminError> {
        self.check()?;
        self.files
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .ok_or(AdminError::NotFound)
    }

    async fn commit_file_location(
        &self,
        file_id: &str,
        element_id: &str,
    ) -> Result<(), AdminError> {
        self.check()?;
        self.committed
            .lock()
            .unwrap()
            .push((file_id.to_string(), element_id.to_string()));
        Ok(())
    }
}

pub(crate) fn catalogue_entry(id: &str, priority: i64, mode: Mode) -> CatalogueEntry {
    CatalogueEntry {
        element_id: id.to_string(),
        endpoint: format!("http://{id}.example:9000"),
        priority,
        mode,
    }
}

pub(crate) fn fresh_capacity(id: &str, total: u64, used: u64) -> CapacityEntry {
    CapacityEntry::derive(
        id,
        total,
        used,
        fise::element::HealthStatus::Healthy,
        &fise::element::Thresholds::default(),
        Utc::now(),
    )
}

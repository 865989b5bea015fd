use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use log::{error, info, warn};
use tokio::sync::{watch, Mutex};

use fise::admin::{AdminApi, CatalogueEntry};
use fise::element::{SeInfo, SeMap};

use crate::metrics::{RELOAD_CHANGES, RELOAD_FAILURE_TOTAL, RELOAD_TOTAL};
use crate::registry::RegistryStore;

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(60);
pub const MIN_RELOAD_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_RELOAD_INTERVAL: Duration = Duration::from_secs(600);

// a reload that finished this recently satisfies a lazy trigger outright,
// so a burst of 507s from one bad element coalesces into one fetch
const FRESH_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ReloadError {
    /// Registry and admin both failed; the previous map stays in place.
    AllSourcesFailed,
}

impl std::fmt::Display for ReloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MapDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl MapDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Pure diff between two catalogue snapshots. Updated means the endpoint,
/// priority, or mode changed for an id present in both.
pub fn diff_maps(old: &SeMap, new: &SeMap) -> MapDiff {
    let mut diff = MapDiff::default();
    for (id, info) in new {
        match old.get(id) {
            None => diff.added.push(id.clone()),
            Some(prev) if prev != info => diff.updated.push(id.clone()),
            Some(_) => {}
        }
    }
    for id in old.keys() {
        if !new.contains_key(id) {
            diff.removed.push(id.clone());
        }
    }
    diff
}

pub fn catalogue_to_map(entries: &[CatalogueEntry]) -> SeMap {
    entries
        .iter()
        .map(|e| {
            (
                e.element_id.clone(),
                SeInfo {
                    endpoint: e.endpoint.clone(),
                    priority: e.priority,
                    mode: e.mode,
                },
            )
        })
        .collect()
}

struct ReloadInner {
    registry: Arc<dyn RegistryStore>,
    admin: Arc<dyn AdminApi>,
    map: ArcSwap<SeMap>,
    // single-flight gate for the fetch/diff/apply cycle
    gate: Mutex<()>,
    last_completed: StdMutex<Option<Instant>>,
    generation: AtomicU64,
    failures: AtomicU64,
}

impl ReloadInner {
    async fn reload_once(&self, reason: &str) -> Result<MapDiff, ReloadError> {
        // registry first, admin as the stale-but-alive fallback
        let (entries, source) = match self.registry.load_catalogue().await {
            Ok(Some(entries)) => (entries, "registry"),
            other => {
                if let Err(e) = other {
                    warn!("catalogue read from registry failed: {e}");
                    RELOAD_FAILURE_TOTAL.with_label_values(&["registry"]).inc();
                }
                match self.admin.list_available_elements().await {
                    Ok(entries) => (entries, "admin"),
                    Err(e) => {
                        warn!("catalogue read from admin failed: {e}");
                        RELOAD_FAILURE_TOTAL.with_label_values(&["admin"]).inc();
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(ReloadError::AllSourcesFailed);
                    }
                }
            }
        };

        let new_map = catalogue_to_map(&entries);
        let old_map = self.map.load_full();
        let diff = diff_maps(&old_map, &new_map);

        // one atomic publish; readers see the old map or the new one, never
        // a mix
        self.map.store(Arc::new(new_map));
        self.generation.fetch_add(1, Ordering::Release);
        *self.last_completed.lock().unwrap() = Some(Instant::now());

        RELOAD_TOTAL.with_label_values(&[source, reason]).inc();
        RELOAD_CHANGES
            .with_label_values(&["added"])
            .inc_by(diff.added.len() as u64);
        RELOAD_CHANGES
            .with_label_values(&["removed"])
            .inc_by(diff.removed.len() as u64);
        RELOAD_CHANGES
            .with_label_values(&["updated"])
            .inc_by(diff.updated.len() as u64);
        if !diff.is_empty() {
            info!(
                "catalogue reload source={source} reason={reason} added={} removed={} updated={}",
                diff.added.len(),
                diff.removed.len(),
                diff.updated.len()
            );
        }

        // best effort: leftover keys for a de-registered element are only
        // confusing, but failing to purge them must not block the reload
        for id in &diff.removed {
            if let Err(e) = self.registry.purge_element(id).await {
                error!("purge of removed element {id} failed: {e}");
            }
        }

        Ok(diff)
    }

    fn recently_completed(&self) -> bool {
        self.last_completed
            .lock()
            .unwrap()
            .map(|at| at.elapsed() < FRESH_WINDOW)
            .unwrap_or(false)
    }
}

/// Keeps this replica's element map in sync with the catalogue. One writer
/// (the periodic loop plus coalesced lazy triggers), any number of readers
/// through [ReloadHandle::snapshot].
pub struct Reloader {
    inner: Arc<ReloadInner>,
    interval: Duration,
    enabled: bool,
}

impl Reloader {
    pub fn new(
        registry: Arc<dyn RegistryStore>,
        admin: Arc<dyn AdminApi>,
        interval: Duration,
        enabled: bool,
    ) -> Self {
        Reloader {
            inner: Arc::new(ReloadInner {
                registry,
                admin,
                map: ArcSwap::from_pointee(SeMap::new()),
                gate: Mutex::new(()),
                last_completed: StdMutex::new(None),
                generation: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
            interval: interval.clamp(MIN_RELOAD_INTERVAL, MAX_RELOAD_INTERVAL),
            enabled,
        }
    }

    pub fn handle(&self) -> ReloadHandle {
        ReloadHandle {
            inner: self.inner.clone(),
        }
    }

    /// Synchronous reload, used at startup so the first request does not
    /// race the first periodic tick.
    pub async fn reload_now(&self, reason: &str) -> Result<MapDiff, ReloadError> {
        let _gate = self.inner.gate.lock().await;
        self.inner.reload_once(reason).await
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.enabled {
            info!("catalogue reloader disabled");
            return;
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    info!("catalogue reloader stopping");
                    return;
                }
            }
            let _gate = self.inner.gate.lock().await;
            if let Err(e) = self.inner.reload_once("periodic").await {
                warn!("periodic reload failed, keeping previous map: {e}");
            }
        }
    }
}

/// The narrow face of the reloader that consumers hold: read the current
/// snapshot, or ask for an out-of-band refresh when an element call smells
/// like stale configuration.
#[derive(Clone)]
pub struct ReloadHandle {
    inner: Arc<ReloadInner>,
}

impl ReloadHandle {
    pub fn snapshot(&self) -> Arc<SeMap> {
        self.inner.map.load_full()
    }

    /// Bumped on every publish; caches key their entries on this.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    /// Lazy reload. Concurrent triggers share one in-flight cycle; a cycle
    /// that completed within the last second satisfies the trigger without
    /// another fetch.
    pub async fn trigger(&self, reason: &str) {
        if self.inner.recently_completed() {
            return;
        }
        let _gate = self.inner.gate.lock().await;
        // a trigger that queued behind another one finds fresh data here
        if self.inner.recently_completed() {
            return;
        }
        if let Err(e) = self.inner.reload_once(reason).await {
            warn!("lazy reload reason={reason} failed: {e}");
        }
    }
}

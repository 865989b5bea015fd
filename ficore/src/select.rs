use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};
use moka::future::Cache;

use fise::admin::AdminApi;
use fise::element::{candidates_by_priority, CapacityEntry, Mode, RetentionPolicy};

use crate::metrics::SELECT_SOURCE_TOTAL;
use crate::registry::{CapacityLookup, RegistryStore};
use crate::reload::ReloadHandle;

pub const DEFAULT_LOCAL_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, thiserror::Error)]
pub enum SelectError {
    /// No element satisfies the predicate for this request.
    NoAvailable,
    /// The pinned target is unknown or in the wrong mode.
    Configuration(String),
    /// Registry and admin both unreachable; nothing trustworthy to select
    /// from.
    CoreUnavailable,
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedSe {
    pub element_id: String,
    pub endpoint: String,
    pub mode: Mode,
}

#[derive(Clone)]
pub struct SelectorConfig {
    pub local_cache_ttl: Duration,
    pub min_headroom_bytes: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig {
            local_cache_ttl: DEFAULT_LOCAL_CACHE_TTL,
            min_headroom_bytes: fise::element::DEFAULT_MIN_HEADROOM_BYTES,
        }
    }
}

enum CapacityFetch {
    Got(CapacityEntry),
    Miss { both_sources_down: bool },
}

/// Picks the element an upload goes to. Deterministic given the same map
/// snapshot and capacity data: candidates are walked in (priority, id)
/// order and the first one passing the predicate wins.
pub struct StorageSelector {
    config: SelectorConfig,
    registry: Arc<dyn RegistryStore>,
    admin: Arc<dyn AdminApi>,
    map: ReloadHandle,
    // short-lived capacity cache to absorb bursts; dropped whole whenever
    // the reloader publishes a new map
    cache: Cache<String, CapacityEntry>,
    cache_generation: AtomicU64,
}

impl StorageSelector {
    pub fn new(
        config: SelectorConfig,
        registry: Arc<dyn RegistryStore>,
        admin: Arc<dyn AdminApi>,
        map: ReloadHandle,
    ) -> Self {
        let ttl = if config.local_cache_ttl.is_zero() {
            // zero would disable expiry entirely, which is the opposite of
            // what a zero ttl means; keep entries for one scheduler tick
            Duration::from_millis(1)
        } else {
            config.local_cache_ttl
        };
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        StorageSelector {
            config,
            registry,
            admin,
            map,
            cache,
            cache_generation: AtomicU64::new(0),
        }
    }

    pub async fn select(
        &self,
        file_size: u64,
        policy: RetentionPolicy,
        target: Option<&str>,
    ) -> Result<SelectedSe, SelectError> {
        self.select_excluding(file_size, policy, target, &[]).await
    }

    /// Like [select] but skipping elements that already failed during this
    /// logical request, so the one permitted reselection cannot land on the
    /// element that just returned 507.
    pub async fn select_excluding(
        &self,
        file_size: u64,
        policy: RetentionPolicy,
        target: Option<&str>,
        exclude: &[&str],
    ) -> Result<SelectedSe, SelectError> {
        self.maybe_invalidate();
        let mode = policy.required_mode();
        let snapshot = self.map.snapshot();

        let candidates: Vec<(&str, &fise::element::SeInfo)> = match target {
            Some(id) => {
                let info = snapshot.get(id).ok_or_else(|| {
                    SelectError::Configuration(format!("target element {id} is not in the catalogue"))
                })?;
                if info.mode != mode {
                    return Err(SelectError::Configuration(format!(
                        "target element {id} has mode {} but the request needs {mode}",
                        info.mode
                    )));
                }
                vec![(id, info)]
            }
            None => candidates_by_priority(&snapshot, mode),
        };

        let needed = file_size.saturating_add(self.config.min_headroom_bytes);
        let mut any_lookup_ok = false;
        let mut all_lookups_both_down = !candidates.is_empty();

        for (id, info) in &candidates {
            if exclude.contains(id) {
                continue;
            }
            match self.capacity_for(id).await {
                CapacityFetch::Got(entry) => {
                    any_lookup_ok = true;
                    all_lookups_both_down = false;
                    if !entry.selectable() {
                        trace!(
                            "skip {id}: status={:?} health={:?}",
                            entry.capacity_status, entry.health_status
                        );
                        continue;
                    }
                    if entry.capacity_free < needed {
                        trace!(
                            "skip {id}: free={} < needed={needed}",
                            entry.capacity_free
                        );
                        continue;
                    }
                    return Ok(SelectedSe {
                        element_id: id.to_string(),
                        endpoint: info.endpoint.clone(),
                        mode: info.mode,
                    });
                }
                CapacityFetch::Miss { both_sources_down } => {
                    if !both_sources_down {
                        all_lookups_both_down = false;
                    }
                }
            }
        }

        if !any_lookup_ok && all_lookups_both_down {
            return Err(SelectError::CoreUnavailable);
        }
        Err(SelectError::NoAvailable)
    }

    fn maybe_invalidate(&self) {
        let current = self.map.generation();
        if self.cache_generation.swap(current, Ordering::AcqRel) != current {
            self.cache.invalidate_all();
        }
    }

    // registry first; stale or missing entries fall through to admin. An
    // element whose data cannot be read from either source is skipped, not
    // fatal, unless that was true of every candidate.
    async fn capacity_for(&self, element_id: &str) -> CapacityFetch {
        if let Some(entry) = self.cache.get(element_id).await {
            return CapacityFetch::Got(entry);
        }
        let registry_down = match self.registry.get_capacity(element_id).await {
            Ok(CapacityLookup::Fresh(entry)) => {
                SELECT_SOURCE_TOTAL.with_label_values(&["registry"]).inc();
                self.cache
                    .insert(element_id.to_string(), entry.clone())
                    .await;
                return CapacityFetch::Got(entry);
            }
            Ok(CapacityLookup::Stale(_)) | Ok(CapacityLookup::Missing) => false,
            Err(e) => {
                warn!("registry capacity read for {element_id} failed: {e}");
                true
            }
        };
        match self.admin.get_capacity(element_id).await {
            Ok(entry) => {
                SELECT_SOURCE_TOTAL.with_label_values(&["admin"]).inc();
                self.cache
                    .insert(element_id.to_string(), entry.clone())
                    .await;
                CapacityFetch::Got(entry)
            }
            Err(e) => {
                warn!("admin capacity read for {element_id} failed: {e}");
                CapacityFetch::Miss {
                    both_sources_down: registry_down,
                }
            }
        }
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{error, info, warn};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use fise::element::{CapacityEntry, HealthEntry, HealthStatus, Mode, Thresholds};
use fise::seclient::{ElementApi, SeError};

use crate::metrics::{MONITOR_INTERVAL, MONITOR_LEADER, MONITOR_POLL_DURATION, MONITOR_POLL_TOTAL};
use crate::registry::{CapacityLookup, RegistryError, RegistryStore};
use crate::reload::ReloadHandle;

pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_LEADER_CHECK: Duration = Duration::from_secs(10);
pub const DEFAULT_PER_SE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONCURRENCY: usize = 16;

#[derive(Clone)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub replica_id: String,
    pub base_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub leader_check: Duration,
    pub per_se_timeout: Duration,
    pub concurrency: usize,
    pub thresholds: Thresholds,
}

impl MonitorConfig {
    pub fn leader_ttl(&self) -> Duration {
        self.base_interval * 3
    }
}

/// Next poll interval from what the cycle saw. Anything critical or full
/// pins to the floor; a uniformly relaxed fleet coasts at the ceiling;
/// in between, interpolate on the single most loaded element.
pub fn compute_interval(
    base: Duration,
    min: Duration,
    max: Duration,
    warning_percent: f64,
    critical_percent: f64,
    max_observed_percent: Option<f64>,
    any_critical_or_full: bool,
) -> Duration {
    let clamp = |d: Duration| d.clamp(min, max);
    let Some(p) = max_observed_percent else {
        return clamp(base);
    };
    if any_critical_or_full {
        return min;
    }
    if p <= warning_percent {
        return max;
    }
    let span = critical_percent - warning_percent;
    if span <= 0.0 {
        return min;
    }
    let frac = ((p - warning_percent) / span).clamp(0.0, 1.0);
    let range = max.saturating_sub(min);
    clamp(max - range.mul_f64(frac))
}

enum Probe {
    Capacity { total: u64, used: u64 },
    Degraded,
    Unavailable,
}

struct Observation {
    element_id: String,
    mode: Mode,
    priority: i64,
    probe: Probe,
}

/// Cluster-wide capacity poller. Every replica runs this loop, only the
/// replica holding `capacity:leader` does any work; the rest retry
/// acquisition at leader_check cadence.
pub struct CapacityMonitor {
    config: MonitorConfig,
    registry: Arc<dyn RegistryStore>,
    elements: Arc<dyn ElementApi>,
    map: ReloadHandle,
}

enum Cycle {
    /// Polled and wrote; sleep this long before the next one.
    Continue(Duration),
    /// Renewal failed; no writes were issued. Back to follower.
    LostLease,
}

enum Wait {
    Elapsed,
    Lost,
    Shutdown,
}

impl CapacityMonitor {
    pub fn new(
        config: MonitorConfig,
        registry: Arc<dyn RegistryStore>,
        elements: Arc<dyn ElementApi>,
        map: ReloadHandle,
    ) -> Self {
        CapacityMonitor {
            config,
            registry,
            elements,
            map,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("capacity monitor disabled on this replica");
            return;
        }
        let mut is_leader = false;
        let mut write_backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                break;
            }
            if !is_leader {
                match self
                    .registry
                    .acquire_leader(&self.config.replica_id, self.config.leader_ttl())
                    .await
                {
                    Ok(true) => {
                        info!("acquired capacity leader lock");
                        is_leader = true;
                        MONITOR_LEADER.set(1);
                    }
                    Ok(false) => {
                        if sleep_or_shutdown(self.config.leader_check, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                    Err(e) => {
                        warn!("leader acquisition failed: {e}");
                        if sleep_or_shutdown(self.config.leader_check, &mut shutdown).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            let wait = match self.leader_cycle().await {
                Ok(Cycle::Continue(interval)) => {
                    write_backoff = Duration::from_secs(1);
                    MONITOR_INTERVAL.set(interval.as_secs_f64());
                    self.leader_wait(interval, &mut shutdown).await
                }
                Ok(Cycle::LostLease) => Wait::Lost,
                Err(e) => {
                    error!("poll cycle failed ({e}), retrying in {write_backoff:?}");
                    let wait = self.leader_wait(write_backoff, &mut shutdown).await;
                    write_backoff = (write_backoff * 2).min(self.config.max_interval);
                    wait
                }
            };
            match wait {
                Wait::Elapsed => {}
                Wait::Lost => {
                    warn!("lost capacity leader lock, dropping to follower");
                    is_leader = false;
                    MONITOR_LEADER.set(0);
                }
                Wait::Shutdown => break,
            }
        }
        if is_leader {
            MONITOR_LEADER.set(0);
            let _ = self.registry.release_leader(&self.config.replica_id).await;
        }
    }

    // the adaptive interval can exceed the lease ttl (120s vs 3x30s), so a
    // leader sleeping between cycles keeps renewing at leader_check cadence
    async fn leader_wait(&self, total: Duration, shutdown: &mut watch::Receiver<bool>) -> Wait {
        let mut remaining = total;
        while !remaining.is_zero() {
            let chunk = remaining.min(self.config.leader_check);
            if sleep_or_shutdown(chunk, shutdown).await {
                return Wait::Shutdown;
            }
            remaining = remaining.saturating_sub(chunk);
            match self
                .registry
                .renew_leader(&self.config.replica_id, self.config.leader_ttl())
                .await
            {
                Ok(true) => {}
                Ok(false) => return Wait::Lost,
                Err(e) => {
                    warn!("lease renewal failed: {e}");
                    return Wait::Lost;
                }
            }
        }
        Wait::Elapsed
    }

    /// One leader iteration: renew, poll the fleet, write through. The
    /// renewal precedes every registry write of the cycle; without a valid
    /// lease nothing is written.
    async fn leader_cycle(&self) -> Result<Cycle, RegistryError> {
        let renewed = self
            .registry
            .renew_leader(&self.config.replica_id, self.config.leader_ttl())
            .await?;
        if !renewed {
            return Ok(Cycle::LostLease);
        }

        let started = Instant::now();
        let observations = self.poll_all().await;
        let interval = self.write_through(&observations).await?;
        MONITOR_POLL_DURATION.observe(started.elapsed().as_secs_f64());
        Ok(Cycle::Continue(interval))
    }

    /// Fan out one capacity probe per mapped element, at most `concurrency`
    /// in flight. Individual failures become observations, never errors.
    async fn poll_all(&self) -> Vec<Observation> {
        let snapshot = self.map.snapshot();
        let sem = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut set = JoinSet::new();
        for (id, info) in snapshot.iter() {
            let elements = self.elements.clone();
            let sem = sem.clone();
            let id = id.clone();
            let endpoint = info.endpoint.clone();
            let mode = info.mode;
            let priority = info.priority;
            let per_se_timeout = self.config.per_se_timeout;
            set.spawn(async move {
                let _guard = sem.acquire().await;
                let probe =
                    match tokio::time::timeout(per_se_timeout, elements.capacity(&endpoint)).await {
                        Ok(Ok(p)) => Probe::Capacity {
                            total: p.capacity_total,
                            used: p.capacity_used,
                        },
                        Ok(Err(SeError::Unavailable)) => Probe::Unavailable,
                        Ok(Err(e)) => {
                            warn!("capacity probe of {id} failed: {e}");
                            Probe::Degraded
                        }
                        Err(_) => Probe::Unavailable,
                    };
                Observation {
                    element_id: id,
                    mode,
                    priority,
                    probe,
                }
            });
        }
        let mut observations = Vec::new();
        while let Some(next) = set.join_next().await {
            match next {
                Ok(obs) => {
                    let outcome = match obs.probe {
                        Probe::Capacity { .. } => "ok",
                        Probe::Degraded => "degraded",
                        Probe::Unavailable => "unavailable",
                    };
                    MONITOR_POLL_TOTAL
                        .with_label_values(&[obs.element_id.as_str(), outcome])
                        .inc();
                    observations.push(obs);
                }
                Err(e) => error!("poll task panicked: {e}"),
            }
        }
        observations
    }

    /// Write every observation through the registry and compute the next
    /// interval from what was seen.
    async fn write_through(&self, observations: &[Observation]) -> Result<Duration, RegistryError> {
        let now = Utc::now();
        let mut max_percent: Option<f64> = None;
        let mut any_critical_or_full = false;

        for obs in observations {
            match &obs.probe {
                Probe::Capacity { total, used } => {
                    let entry = CapacityEntry::derive(
                        &obs.element_id,
                        *total,
                        *used,
                        HealthStatus::Healthy,
                        &self.config.thresholds,
                        now,
                    );
                    if entry.capacity_percent >= self.config.thresholds.critical_percent
                        || entry.capacity_status == fise::element::CapacityStatus::Full
                    {
                        any_critical_or_full = true;
                    }
                    max_percent = Some(
                        max_percent
                            .map(|m| m.max(entry.capacity_percent))
                            .unwrap_or(entry.capacity_percent),
                    );
                    let member = obs.mode.writable() && entry.selectable();
                    self.registry
                        .apply_observation(&entry, obs.mode, obs.priority, member)
                        .await?;
                }
                Probe::Degraded | Probe::Unavailable => {
                    let health = if matches!(obs.probe, Probe::Degraded) {
                        HealthStatus::Degraded
                    } else {
                        HealthStatus::Unavailable
                    };
                    self.mark_unhealthy(obs, health, now).await?;
                }
            }
        }
        Ok(compute_interval(
            self.config.base_interval,
            self.config.min_interval,
            self.config.max_interval,
            self.config.thresholds.warning_percent,
            self.config.thresholds.critical_percent,
            max_percent,
            any_critical_or_full,
        ))
    }

    // a failed probe gives us no numbers, so keep the previous ones when we
    // have them and only rewrite the health fields
    async fn mark_unhealthy(
        &self,
        obs: &Observation,
        health: HealthStatus,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        match self.registry.get_capacity(&obs.element_id).await? {
            CapacityLookup::Fresh(mut entry) | CapacityLookup::Stale(mut entry) => {
                entry.health_status = health;
                entry.last_updated = now;
                let member = obs.mode.writable() && entry.selectable();
                self.registry
                    .apply_observation(&entry, obs.mode, obs.priority, member)
                    .await
            }
            CapacityLookup::Missing => {
                self.registry
                    .put_health(&HealthEntry {
                        element_id: obs.element_id.clone(),
                        health_status: health,
                        last_updated: now,
                    })
                    .await?;
                self.registry
                    .remove_available(obs.mode, &obs.element_id)
                    .await
            }
        }
    }
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reload::Reloader;
    use crate::testutil::{catalogue_entry, FakeAdmin, FakeSe, MemRegistry};
    use fise::element::CapacityStatus;

    const GIB: u64 = 1 << 30;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn interval_floor_on_critical() {
        let d = compute_interval(secs(30), secs(10), secs(120), 80.0, 90.0, Some(95.0), true);
        assert_eq!(secs(10), d);
    }

    #[test]
    fn interval_ceiling_when_all_relaxed() {
        let d = compute_interval(secs(30), secs(10), secs(120), 80.0, 90.0, Some(40.0), false);
        assert_eq!(secs(120), d);
    }

    #[test]
    fn interval_interpolates_between_warning_and_critical() {
        // midpoint of 80..90 should land at the midpoint of 120..10
        let d = compute_interval(secs(30), secs(10), secs(120), 80.0, 90.0, Some(85.0), false);
        assert_eq!(secs(65), d);
    }

    #[test]
    fn interval_base_when_nothing_observed() {
        let d = compute_interval(secs(30), secs(10), secs(120), 80.0, 90.0, None, false);
        assert_eq!(secs(30), d);
    }

    fn config(replica: &str) -> MonitorConfig {
        MonitorConfig {
            enabled: true,
            replica_id: replica.to_string(),
            base_interval: DEFAULT_BASE_INTERVAL,
            min_interval: DEFAULT_MIN_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            leader_check: DEFAULT_LEADER_CHECK,
            per_se_timeout: secs(1),
            concurrency: DEFAULT_CONCURRENCY,
            thresholds: Thresholds::default(),
        }
    }

    async fn handle_for(registry: Arc<MemRegistry>) -> ReloadHandle {
        let admin = Arc::new(FakeAdmin::new());
        let reloader = Reloader::new(registry, admin, secs(60), true);
        reloader.reload_now("test").await.unwrap();
        reloader.handle()
    }

    #[tokio::test]
    async fn cycle_writes_capacity_health_and_membership() {
        let registry = Arc::new(MemRegistry::new());
        registry.set_catalogue(vec![
            catalogue_entry("se-a", 100, Mode::Edit),
            catalogue_entry("se-b", 200, Mode::Rw),
            catalogue_entry("se-c", 300, Mode::Ro),
        ]);
        let map = handle_for(registry.clone()).await;
        let se = Arc::new(FakeSe::new());
        se.set_capacity("http://se-a.example:9000", 10 * GIB, GIB);
        se.set_capacity("http://se-b.example:9000", 10 * GIB, GIB);
        se.set_capacity("http://se-c.example:9000", 10 * GIB, GIB);

        let monitor = CapacityMonitor::new(config("r1"), registry.clone(), se, map);
        registry.acquire_leader("r1", secs(90)).await.unwrap();
        let cycle = monitor.leader_cycle().await.unwrap();
        assert!(matches!(cycle, Cycle::Continue(_)));

        let entry = registry.capacity_of("se-a").unwrap();
        assert_eq!(CapacityStatus::Ok, entry.capacity_status);
        assert_eq!(HealthStatus::Healthy, entry.health_status);
        assert_eq!(9 * GIB, entry.capacity_free);
        assert_eq!(
            HealthStatus::Healthy,
            registry.health_of("se-a").unwrap().health_status
        );
        assert_eq!(vec!["se-a"], registry.members(Mode::Edit));
        assert_eq!(vec!["se-b"], registry.members(Mode::Rw));
        // read-only elements never join an available set
        assert!(registry.members(Mode::Ro).is_empty());
    }

    #[tokio::test]
    async fn full_element_is_dropped_from_membership() {
        let registry = Arc::new(MemRegistry::new());
        registry.set_catalogue(vec![
            catalogue_entry("se-a", 100, Mode::Edit),
            catalogue_entry("se-b", 200, Mode::Edit),
        ]);
        let map = handle_for(registry.clone()).await;
        let se = Arc::new(FakeSe::new());
        se.set_capacity("http://se-a.example:9000", 10 * GIB, GIB);
        // 99% used
        se.set_capacity("http://se-b.example:9000", 100 * GIB, 99 * GIB);

        let monitor = CapacityMonitor::new(config("r1"), registry.clone(), se, map);
        registry.acquire_leader("r1", secs(90)).await.unwrap();
        let cycle = monitor.leader_cycle().await.unwrap();

        assert_eq!(
            CapacityStatus::Full,
            registry.capacity_of("se-b").unwrap().capacity_status
        );
        assert_eq!(vec!["se-a"], registry.members(Mode::Edit));
        // anything full pins the poll interval to the floor
        match cycle {
            Cycle::Continue(d) => assert_eq!(DEFAULT_MIN_INTERVAL, d),
            Cycle::LostLease => panic!("should still hold the lease"),
        }
    }

    #[tokio::test]
    async fn unreachable_element_keeps_numbers_loses_membership() {
        let registry = Arc::new(MemRegistry::new());
        registry.set_catalogue(vec![catalogue_entry("se-a", 100, Mode::Edit)]);
        let map = handle_for(registry.clone()).await;
        let se = Arc::new(FakeSe::new());
        se.set_capacity("http://se-a.example:9000", 10 * GIB, GIB);

        let monitor = CapacityMonitor::new(config("r1"), registry.clone(), se.clone(), map);
        registry.acquire_leader("r1", secs(90)).await.unwrap();
        monitor.leader_cycle().await.unwrap();
        assert_eq!(vec!["se-a"], registry.members(Mode::Edit));
        let before = registry.capacity_of("se-a").unwrap();

        se.set_capacity_error("http://se-a.example:9000", SeError::Unavailable);
        monitor.leader_cycle().await.unwrap();
        let after = registry.capacity_of("se-a").unwrap();
        assert_eq!(HealthStatus::Unavailable, after.health_status);
        assert_eq!(before.capacity_free, after.capacity_free);
        assert!(after.last_updated >= before.last_updated);
        assert!(registry.members(Mode::Edit).is_empty());
    }

    #[tokio::test]
    async fn lost_lease_aborts_before_writes() {
        let registry = Arc::new(MemRegistry::new());
        registry.set_catalogue(vec![catalogue_entry("se-a", 100, Mode::Edit)]);
        let map = handle_for(registry.clone()).await;
        let se = Arc::new(FakeSe::new());
        se.set_capacity("http://se-a.example:9000", 10 * GIB, GIB);

        // another replica holds the lock
        registry.acquire_leader("other", secs(90)).await.unwrap();
        let monitor = CapacityMonitor::new(config("r1"), registry.clone(), se, map);
        let cycle = monitor.leader_cycle().await.unwrap();
        assert!(matches!(cycle, Cycle::LostLease));
        assert!(registry.capacity_of("se-a").is_none());
    }

    #[tokio::test]
    async fn per_element_failure_does_not_abort_cycle() {
        let registry = Arc::new(MemRegistry::new());
        registry.set_catalogue(vec![
            catalogue_entry("se-a", 100, Mode::Edit),
            catalogue_entry("se-b", 200, Mode::Edit),
        ]);
        let map = handle_for(registry.clone()).await;
        let se = Arc::new(FakeSe::new());
        se.set_capacity_error(
            "http://se-a.example:9000",
            SeError::Server(http::StatusCode::INTERNAL_SERVER_ERROR),
        );
        se.set_capacity("http://se-b.example:9000", 10 * GIB, GIB);

        let monitor = CapacityMonitor::new(config("r1"), registry.clone(), se, map);
        registry.acquire_leader("r1", secs(90)).await.unwrap();
        monitor.leader_cycle().await.unwrap();

        // 5xx marks degraded (still selectable), healthy sibling unaffected
        assert_eq!(
            HealthStatus::Degraded,
            registry.health_of("se-a").unwrap().health_status
        );
        assert_eq!(
            HealthStatus::Healthy,
            registry.health_of("se-b").unwrap().health_status
        );
        assert_eq!(vec!["se-b"], registry.members(Mode::Edit));
    }
}

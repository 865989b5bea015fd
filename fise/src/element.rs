use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WARNING_PERCENT: f64 = 80.0;
pub const DEFAULT_CRITICAL_PERCENT: f64 = 90.0;
pub const DEFAULT_FULL_PERCENT: f64 = 98.0;
pub const DEFAULT_MIN_HEADROOM_BYTES: u64 = 64 * 1024 * 1024;

/// What a storage element is allowed to hold. Only edit and rw accept new
/// writes; edit hosts temporary files, rw hosts permanent ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Edit,
    Rw,
    Ro,
    #[serde(alias = "ar")]
    Archive,
}

impl Mode {
    pub fn writable(&self) -> bool {
        matches!(self, Mode::Edit | Mode::Rw)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Edit => "edit",
            Mode::Rw => "rw",
            Mode::Ro => "ro",
            Mode::Archive => "archive",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    Temporary,
    Permanent,
}

impl RetentionPolicy {
    pub fn required_mode(&self) -> Mode {
        match self {
            RetentionPolicy::Temporary => Mode::Edit,
            RetentionPolicy::Permanent => Mode::Rw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityStatus {
    Ok,
    Warning,
    Critical,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub warning_percent: f64,
    pub critical_percent: f64,
    pub full_percent: f64,
    pub min_headroom_bytes: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            warning_percent: DEFAULT_WARNING_PERCENT,
            critical_percent: DEFAULT_CRITICAL_PERCENT,
            full_percent: DEFAULT_FULL_PERCENT,
            min_headroom_bytes: DEFAULT_MIN_HEADROOM_BYTES,
        }
    }
}

impl Thresholds {
    pub fn status_for(&self, percent: f64, free: u64) -> CapacityStatus {
        if percent >= self.full_percent || free < self.min_headroom_bytes {
            CapacityStatus::Full
        } else if percent >= self.critical_percent {
            CapacityStatus::Critical
        } else if percent >= self.warning_percent {
            CapacityStatus::Warning
        } else {
            CapacityStatus::Ok
        }
    }
}

// a zero-total element reports 100% so it derives as full rather than ok
pub fn capacity_percent(total: u64, used: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// The per-element capacity record written to and read from the registry
/// under `capacity:{element_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityEntry {
    pub element_id: String,
    pub capacity_total: u64,
    pub capacity_used: u64,
    pub capacity_free: u64,
    pub capacity_percent: f64,
    pub capacity_status: CapacityStatus,
    pub health_status: HealthStatus,
    pub last_updated: DateTime<Utc>,
}

impl CapacityEntry {
    /// Normalizes raw totals into a consistent entry: free is recomputed from
    /// total and used, percent is clamped, status derived from thresholds.
    pub fn derive(
        element_id: &str,
        total: u64,
        used: u64,
        health: HealthStatus,
        thresholds: &Thresholds,
        now: DateTime<Utc>,
    ) -> CapacityEntry {
        let free = total.saturating_sub(used);
        let percent = capacity_percent(total, used);
        CapacityEntry {
            element_id: element_id.to_string(),
            capacity_total: total,
            capacity_used: used,
            capacity_free: free,
            capacity_percent: percent,
            capacity_status: thresholds.status_for(percent, free),
            health_status: health,
            last_updated: now,
        }
    }

    pub fn selectable(&self) -> bool {
        self.capacity_status != CapacityStatus::Full
            && self.health_status != HealthStatus::Unavailable
    }
}

/// Registry value under `health:{element_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEntry {
    pub element_id: String,
    pub health_status: HealthStatus,
    pub last_updated: DateTime<Utc>,
}

/// One row of the catalogue: where an element lives and how much we prefer
/// it. Lower priority wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeInfo {
    pub endpoint: String,
    pub priority: i64,
    pub mode: Mode,
}

/// Immutable snapshot of the catalogue as one replica sees it. Published
/// whole behind an ArcSwap by the reloader; BTreeMap keeps id iteration
/// deterministic.
pub type SeMap = BTreeMap<String, SeInfo>;

/// Candidates for `mode` ordered by (priority asc, element_id asc). The
/// element_id tiebreak comes for free from the BTreeMap iteration order and
/// a stable sort on priority.
pub fn candidates_by_priority<'a>(map: &'a SeMap, mode: Mode) -> Vec<(&'a str, &'a SeInfo)> {
    let mut out: Vec<(&str, &SeInfo)> = map
        .iter()
        .filter(|(_, info)| info.mode == mode)
        .map(|(id, info)| (id.as_str(), info))
        .collect();
    out.sort_by_key(|(_, info)| info.priority);
    out
}

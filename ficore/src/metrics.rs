use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, Gauge, Histogram, HistogramVec, IntCounter,
    IntCounterVec, IntGauge,
};

pub static MONITOR_POLL_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fi_monitor_poll_total",
        "Capacity polls per element and outcome",
        &["element", "outcome"]
    )
    .unwrap()
});

pub static MONITOR_POLL_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "fi_monitor_poll_duration_seconds",
        "Duration of one full capacity poll cycle"
    )
    .unwrap()
});

pub static MONITOR_INTERVAL: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "fi_monitor_interval_seconds",
        "Current adaptive poll interval"
    )
    .unwrap()
});

pub static MONITOR_LEADER: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "fi_monitor_leader",
        "1 when this replica holds the capacity leader lock"
    )
    .unwrap()
});

pub static RELOAD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fi_reload_total",
        "Catalogue reloads by source and reason",
        &["source", "reason"]
    )
    .unwrap()
});

pub static RELOAD_FAILURE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fi_reload_failure_total",
        "Catalogue reload failures by source",
        &["source"]
    )
    .unwrap()
});

pub static RELOAD_CHANGES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fi_reload_changes_total",
        "Catalogue diff entries applied",
        &["kind"]
    )
    .unwrap()
});

pub static SELECT_SOURCE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fi_select_capacity_source_total",
        "Where the selector got capacity data from",
        &["source"]
    )
    .unwrap()
});

pub static UPLOAD_ATTEMPT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fi_upload_attempt_total",
        "Upload attempts against elements by outcome class",
        &["outcome"]
    )
    .unwrap()
});

pub static UPLOAD_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fi_upload_duration_seconds",
        "Wall time of one logical upload",
        &["outcome"]
    )
    .unwrap()
});

pub static FINALIZE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "fi_finalize_total",
        "Finalize transactions by terminal state",
        &["state"]
    )
    .unwrap()
});

pub static REGISTRY_FAILURE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "fi_registry_failure_total",
        "Registry operations that returned an error"
    )
    .unwrap()
});

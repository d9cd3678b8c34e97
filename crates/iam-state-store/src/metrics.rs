//! Prometheus metrics for state store operations
//!
//! Provides observability into store operations including:
//! - Lock acquisitions, contention and stale locks
//! - Version conflicts
//! - Operation latencies and error rates

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Once;
use tracing::info;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Lock metrics
    pub static ref LOCKS_ACQUIRED_TOTAL: Counter = Counter::new(
        "iamctl_state_locks_acquired_total",
        "Total number of instance locks acquired"
    ).unwrap();

    /// Acquisitions refused because another holder's lease was live
    pub static ref LOCKS_CONTENDED_TOTAL: Counter = Counter::new(
        "iamctl_state_locks_contended_total",
        "Lock acquisitions refused due to a live lease"
    ).unwrap();

    /// Expired leases taken over by a new holder
    pub static ref LOCKS_RECLAIMED_TOTAL: Counter = Counter::new(
        "iamctl_state_locks_reclaimed_total",
        "Expired locks reclaimed by another holder"
    ).unwrap();

    pub static ref STALE_LOCK_REJECTIONS_TOTAL: Counter = Counter::new(
        "iamctl_state_stale_lock_rejections_total",
        "Writes rejected because the lock token was stale"
    ).unwrap();

    pub static ref VERSION_CONFLICTS_TOTAL: Counter = Counter::new(
        "iamctl_state_version_conflicts_total",
        "Writes rejected because of a version mismatch"
    ).unwrap();

    // Store operation metrics
    /// Store operation latency
    pub static ref STORE_OP_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("iamctl_state_store_operation_seconds", "Store operation duration")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["operation", "store_type"]
    ).unwrap();

    /// Store operation errors
    pub static ref STORE_OP_ERRORS: CounterVec = CounterVec::new(
        Opts::new("iamctl_state_store_errors_total", "Store operation errors"),
        &["operation", "store_type", "error_type"]
    ).unwrap();

    // Audit metrics
    /// Audit log entries
    pub static ref AUDIT_ENTRIES_TOTAL: Counter = Counter::new(
        "iamctl_state_audit_entries_total",
        "Total audit log entries"
    ).unwrap();
}

static INIT: Once = Once::new();

/// Register all metrics with the global registry
pub fn register_metrics() {
    INIT.call_once(|| {
        info!("Registering state store metrics");

        REGISTRY.register(Box::new(LOCKS_ACQUIRED_TOTAL.clone())).ok();
        REGISTRY.register(Box::new(LOCKS_CONTENDED_TOTAL.clone())).ok();
        REGISTRY.register(Box::new(LOCKS_RECLAIMED_TOTAL.clone())).ok();
        REGISTRY.register(Box::new(STALE_LOCK_REJECTIONS_TOTAL.clone())).ok();
        REGISTRY.register(Box::new(VERSION_CONFLICTS_TOTAL.clone())).ok();

        REGISTRY.register(Box::new(STORE_OP_DURATION.clone())).ok();
        REGISTRY.register(Box::new(STORE_OP_ERRORS.clone())).ok();

        REGISTRY.register(Box::new(AUDIT_ENTRIES_TOTAL.clone())).ok();

        info!("State store metrics registered");
    });
}

/// Helper to time a store operation
pub struct OperationTimer {
    operation: &'static str,
    store_type: &'static str,
    start: std::time::Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str, store_type: &'static str) -> Self {
        Self {
            operation,
            store_type,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        STORE_OP_DURATION
            .with_label_values(&[self.operation, self.store_type])
            .observe(duration);
    }
}

pub fn record_lock_acquired() {
    LOCKS_ACQUIRED_TOTAL.inc();
}

pub fn record_lock_contended() {
    LOCKS_CONTENDED_TOTAL.inc();
}

pub fn record_lock_reclaimed() {
    LOCKS_RECLAIMED_TOTAL.inc();
}

pub fn record_stale_lock() {
    STALE_LOCK_REJECTIONS_TOTAL.inc();
}

pub fn record_version_conflict() {
    VERSION_CONFLICTS_TOTAL.inc();
}

/// Record an audit entry
pub fn record_audit_entry() {
    AUDIT_ENTRIES_TOTAL.inc();
}

/// Record a store error
pub fn record_store_error(operation: &str, store_type: &str, error_type: &str) {
    STORE_OP_ERRORS
        .with_label_values(&[operation, store_type, error_type])
        .inc();
}

/// Get metrics as text for Prometheus scraping
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

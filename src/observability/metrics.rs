//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `service_catalog_reconciliations_total{kind}` - Total number of reconciliations
//! - `service_catalog_reconciliation_errors_total{kind}` - Total number of reconciliation errors
//! - `service_catalog_reconciliation_duration_seconds{kind}` - Duration of reconciliations
//! - `service_catalog_requeues_total{kind,reason}` - Keys put back on a queue
//! - `service_catalog_broker_requests_total{operation,outcome}` - Broker calls by outcome
//! - `service_catalog_broker_request_duration_seconds{operation}` - Duration of broker calls
//! - `service_catalog_catalog_syncs_total{trigger}` - Catalog fetches by relist trigger
//! - `service_catalog_orphan_mitigations_total{kind}` - Orphan mitigations started
//! - `service_catalog_queue_depth{kind}` - Keys waiting in each work queue

use anyhow::Result;
use prometheus::{HistogramVec, IntCounterVec, IntGaugeVec, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_reconciliations_total",
            "Total number of reconciliations by resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_reconciliation_errors_total",
            "Total number of reconciliation errors by resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "service_catalog_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds by resource kind",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["kind"],
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_requeues_total",
            "Total number of requeued keys by resource kind and reason",
        ),
        &["kind", "reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static BROKER_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_broker_requests_total",
            "Total number of broker requests by operation and outcome",
        ),
        &["operation", "outcome"],
    )
    .expect("Failed to create BROKER_REQUESTS_TOTAL metric - this should never happen")
});

static BROKER_REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "service_catalog_broker_request_duration_seconds",
            "Duration of broker requests in seconds by operation",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["operation"],
    )
    .expect("Failed to create BROKER_REQUEST_DURATION metric - this should never happen")
});

static CATALOG_SYNCS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_catalog_syncs_total",
            "Total number of catalog fetches by relist trigger",
        ),
        &["trigger"],
    )
    .expect("Failed to create CATALOG_SYNCS_TOTAL metric - this should never happen")
});

static ORPHAN_MITIGATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "service_catalog_orphan_mitigations_total",
            "Total number of orphan mitigations started by resource kind",
        ),
        &["kind"],
    )
    .expect("Failed to create ORPHAN_MITIGATIONS_TOTAL metric - this should never happen")
});

static QUEUE_DEPTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        prometheus::Opts::new(
            "service_catalog_queue_depth",
            "Current number of keys waiting in each work queue",
        ),
        &["kind"],
    )
    .expect("Failed to create QUEUE_DEPTH metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_REQUEST_DURATION.clone()))?;
    REGISTRY.register(Box::new(CATALOG_SYNCS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ORPHAN_MITIGATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;

    Ok(())
}

pub fn increment_reconciliations(kind: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_reconciliation_errors(kind: &str) {
    RECONCILIATION_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn observe_reconciliation_duration(kind: &str, duration: f64) {
    RECONCILIATION_DURATION
        .with_label_values(&[kind])
        .observe(duration);
}

pub fn increment_requeues(kind: &str, reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[kind, reason]).inc();
}

/// Record one broker call and its outcome (`success`, `transient`, `rejected`, `ambiguous`)
pub fn record_broker_request(operation: &str, outcome: &str, duration: f64) {
    BROKER_REQUESTS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    BROKER_REQUEST_DURATION
        .with_label_values(&[operation])
        .observe(duration);
}

pub fn increment_catalog_syncs(trigger: &str) {
    CATALOG_SYNCS_TOTAL.with_label_values(&[trigger]).inc();
}

pub fn increment_orphan_mitigations(kind: &str) {
    ORPHAN_MITIGATIONS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn set_queue_depth(kind: &str, depth: usize) {
    let depth = i64::try_from(depth).unwrap_or(i64::MAX);
    QUEUE_DEPTH.with_label_values(&[kind]).set(depth);
}

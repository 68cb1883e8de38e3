//! Metrics module for tenant-billing.
//! Provides Prometheus metrics for webhook ingestion, quota enforcement and
//! billing status transitions.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, Encoder, HistogramTimer, HistogramVec, IntCounterVec, Registry,
    TextEncoder,
};

pub struct BillingMetrics {
    registry: Registry,
    webhook_events: IntCounterVec,
    quota_rejections: IntCounterVec,
    status_transitions: IntCounterVec,
    db_query_duration: HistogramVec,
}

impl BillingMetrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let webhook_events = IntCounterVec::new(
            opts!(
                "billing_webhook_events_total",
                "Webhook deliveries by endpoint and outcome"
            ),
            &["endpoint", "outcome"],
        )?;
        let quota_rejections = IntCounterVec::new(
            opts!(
                "billing_quota_rejections_total",
                "Reservations rejected for exceeding the plan bound"
            ),
            &["resource"],
        )?;
        let status_transitions = IntCounterVec::new(
            opts!(
                "billing_status_transitions_total",
                "Organization billing status changes by target status"
            ),
            &["to"],
        )?;
        let db_query_duration = HistogramVec::new(
            histogram_opts!(
                "billing_db_query_duration_seconds",
                "Database query duration"
            ),
            &["operation"],
        )?;

        registry.register(Box::new(webhook_events.clone()))?;
        registry.register(Box::new(quota_rejections.clone()))?;
        registry.register(Box::new(status_transitions.clone()))?;
        registry.register(Box::new(db_query_duration.clone()))?;

        Ok(Self {
            registry,
            webhook_events,
            quota_rejections,
            status_transitions,
            db_query_duration,
        })
    }
}

static METRICS: Lazy<Option<BillingMetrics>> = Lazy::new(|| match BillingMetrics::new() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        tracing::error!(error = %e, "Failed to register billing metrics");
        None
    }
});

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    Lazy::force(&METRICS);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let Some(metrics) = METRICS.as_ref() else {
        return String::new();
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metrics.registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Start a timer for a database operation. Observed on drop.
pub fn db_timer(operation: &str) -> Option<HistogramTimer> {
    METRICS.as_ref().map(|m| {
        m.db_query_duration
            .with_label_values(&[operation])
            .start_timer()
    })
}

/// Record a webhook delivery outcome.
pub fn record_webhook_event(endpoint: &str, outcome: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.webhook_events.with_label_values(&[endpoint, outcome]).inc();
    }
}

/// Record a rejected reservation.
pub fn record_quota_rejection(resource: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.quota_rejections.with_label_values(&[resource]).inc();
    }
}

/// Record a billing status change.
pub fn record_status_transition(to: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.status_transitions.with_label_values(&[to]).inc();
    }
}

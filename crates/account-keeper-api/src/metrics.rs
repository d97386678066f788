//! Metrics collection for the API service.

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, HistogramVec, IntCounter, IntCounterVec,
    Registry, TextEncoder,
};
use std::{sync::Arc, time::Duration};

/// Service metrics for observability
///
/// Metrics live in a registry owned by this value, so several instances can
/// coexist in one process.
#[derive(Debug)]
pub struct ServiceMetrics {
    registry: Registry,

    // Webhook processing metrics
    pub webhook_requests_total: IntCounterVec,
    pub webhook_duration_seconds: HistogramVec,
    pub verification_failures_total: IntCounterVec,

    // Reconciliation metrics
    pub reconcile_outcomes_total: IntCounterVec,
    pub reconcile_errors_total: IntCounterVec,

    pub dead_letter_write_failures: IntCounter,
}

impl ServiceMetrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new_custom(Some("account_keeper".to_string()), None)?;

        Ok(Arc::new(Self {
            webhook_requests_total: register_int_counter_vec_with_registry!(
                "webhook_requests_total",
                "Total webhook requests received",
                &["provider"],
                registry
            )?,
            webhook_duration_seconds: register_histogram_vec_with_registry!(
                "webhook_duration_seconds",
                "Webhook processing time distribution",
                &["provider"],
                vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0],
                registry
            )?,
            verification_failures_total: register_int_counter_vec_with_registry!(
                "verification_failures_total",
                "Webhooks rejected before reconciliation",
                &["provider", "kind"],
                registry
            )?,
            reconcile_outcomes_total: register_int_counter_vec_with_registry!(
                "reconcile_outcomes_total",
                "Acknowledged webhooks by reconciliation outcome",
                &["provider", "outcome"],
                registry
            )?,
            reconcile_errors_total: register_int_counter_vec_with_registry!(
                "reconcile_errors_total",
                "Verified webhooks that could not be applied",
                &["provider", "kind"],
                registry
            )?,
            dead_letter_write_failures: register_int_counter_with_registry!(
                "dead_letter_write_failures",
                "Rejected events that could not be dead-lettered",
                registry
            )?,
            registry,
        }))
    }

    pub fn record_webhook_request(&self, provider: &str, duration: Duration) {
        self.webhook_requests_total
            .with_label_values(&[provider])
            .inc();
        self.webhook_duration_seconds
            .with_label_values(&[provider])
            .observe(duration.as_secs_f64());
    }

    /// Render every registered metric in the Prometheus text format
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

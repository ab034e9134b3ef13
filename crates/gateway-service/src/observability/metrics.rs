//! Metric definitions for the gateway.
//!
//! Prometheus naming: `gateway_` prefix, `_total` for counters, `_seconds`
//! for duration histograms.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Probes are device I/O bound: tens of milliseconds up to the timeout
        .set_buckets_for_metric(
            Matcher::Prefix("gateway_registration".to_string()),
            &[0.010, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000],
        )
        .map_err(|e| format!("Failed to set registration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Metric: `gateway_devices_active`
pub fn set_devices_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gateway_devices_active").set(count as f64);
}

/// Metric: `gateway_status_observers`
pub fn set_status_observers(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gateway_status_observers").set(count as f64);
}

/// Metric: `gateway_signaling_sessions_active`
pub fn set_signaling_sessions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gateway_signaling_sessions_active").set(count as f64);
}

/// Metrics: `gateway_registrations_total{outcome}` and
/// `gateway_registration_duration_seconds`.
///
/// `outcome`: online, offline, discarded
pub fn record_registration(outcome: &'static str, duration: Duration) {
    counter!("gateway_registrations_total", "outcome" => outcome).increment(1);
    histogram!("gateway_registration_duration_seconds").record(duration.as_secs_f64());
}

/// Metric: `gateway_control_link_attempts_total{outcome}`
///
/// `outcome`: ready, unreachable, auth_failed, bad_room_token
pub fn record_control_link_attempt(outcome: &'static str) {
    counter!("gateway_control_link_attempts_total", "outcome" => outcome).increment(1);
}

/// Metric: `gateway_observers_evicted_total`
pub fn record_observer_evicted() {
    counter!("gateway_observers_evicted_total").increment(1);
}

/// Metric: `gateway_actor_panics_total{actor_type}`
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("gateway_actor_panics_total", "actor_type" => actor_type).increment(1);
}

/// Metric: `gateway_storage_failures_total{op}`
pub fn record_storage_failure(op: &'static str) {
    counter!("gateway_storage_failures_total", "op" => op).increment(1);
}

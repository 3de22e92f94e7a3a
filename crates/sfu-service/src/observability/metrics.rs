//! Prometheus metric definitions for the SFU.
//!
//! Naming follows Prometheus conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! - `actor_type`: 3 values (registry, room, connection)
//! - `event`: bounded by the signaling event set (~11 request events, 6 pushes)
//! - `status`: `success` or an `ErrorCode` string (~12 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metric is recorded. Signaling latency buckets
/// target sub-100ms request handling.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Resource gauges
// ============================================================================

/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Metric: `sfu_peers_active`
pub fn set_peers_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_active").set(count as f64);
}

/// Metric: `sfu_producers_active`
pub fn set_producers_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_producers_active").set(count as f64);
}

/// Metric: `sfu_consumers_active`
pub fn set_consumers_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_consumers_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
///
/// High values mean the actor is falling behind.
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record one handled signaling request.
///
/// Metrics: `sfu_signaling_requests_total` (labels `event`, `status`) and
/// `sfu_signaling_latency_seconds` (label `event`).
pub fn record_signaling_request(event: &str, status: &str, duration: Duration) {
    counter!(
        "sfu_signaling_requests_total",
        "event" => event.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("sfu_signaling_latency_seconds", "event" => event.to_string())
        .record(duration.as_secs_f64());
}

/// Record a push dropped because the peer's outbound queue was full.
///
/// Metric: `sfu_push_dropped_total`
/// Labels: `event`
///
/// Pushes are never redelivered. The connection is closed on the first
/// drop, so each increment is one slow client forced to rejoin.
pub fn record_push_dropped(event: &str) {
    counter!("sfu_push_dropped_total", "event" => event.to_string()).increment(1);
}

/// Record an actor panic.
///
/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

//! Observability for the SFU: Prometheus metrics and health endpoints.
//!
//! # Metrics
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sfu_rooms_active` | Gauge | none |
//! | `sfu_peers_active` | Gauge | none |
//! | `sfu_producers_active` | Gauge | none |
//! | `sfu_consumers_active` | Gauge | none |
//! | `sfu_signaling_requests_total` | Counter | `event`, `status` |
//! | `sfu_signaling_latency_seconds` | Histogram | `event` |
//! | `sfu_push_dropped_total` | Counter | `event` |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` |
//! | `sfu_actor_panics_total` | Counter | `actor_type` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::{
    init_metrics_recorder, record_actor_panic, record_push_dropped, record_signaling_request,
    set_actor_mailbox_depth, set_consumers_active, set_peers_active, set_producers_active,
    set_rooms_active,
};

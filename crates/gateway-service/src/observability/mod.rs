//! Observability for the gateway: health endpoints and Prometheus metrics.
//!
//! Metric labels are bounded:
//! - `actor_type`: hub, device
//! - `outcome`: a handful of values per counter
//! - `op`: storage operations (put, remove, scalar)
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `gateway_devices_active` | Gauge | none | Live device actors |
//! | `gateway_status_observers` | Gauge | none | Connected local clients |
//! | `gateway_signaling_sessions_active` | Gauge | none | Open signaling sockets |
//! | `gateway_registrations_total` | Counter | `outcome` | Finished probes |
//! | `gateway_registration_duration_seconds` | Histogram | none | Probe duration |
//! | `gateway_control_link_attempts_total` | Counter | `outcome` | Dial/login attempts |
//! | `gateway_observers_evicted_total` | Counter | none | Slow local clients dropped |
//! | `gateway_actor_panics_total` | Counter | `actor_type` | Contained handler panics |
//! | `gateway_storage_failures_total` | Counter | `op` | Failed persistence calls |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;

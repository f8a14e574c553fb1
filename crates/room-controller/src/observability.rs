//! Metrics for the coordinator.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sfu_room_publishers_active` | Gauge | none |
//! | `sfu_room_workers_active` | Gauge | none |
//! | `sfu_room_worker_creations_total` | Counter | `status` |
//! | `sfu_room_worker_failures_total` | Counter | none |
//! | `sfu_room_migrations_total` | Counter | `status` |
//! | `sfu_room_signaling_forwarded_total` | Counter | `type` |
//! | `sfu_room_events_total` | Counter | `event` |
//!
//! `status` is `success` or `error`; `type` is a signaling message type.

use metrics::{counter, gauge};

/// Metric: `sfu_room_publishers_active`
pub fn set_publishers_active(count: usize) {
    // usize to f64 conversion is safe for realistic publisher counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_room_publishers_active").set(count as f64);
}

/// Metric: `sfu_room_workers_active` (workers with an open outbox)
pub fn set_workers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_room_workers_active").set(count as f64);
}

/// Metric: `sfu_room_worker_creations_total`
pub fn record_worker_creation(success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("sfu_room_worker_creations_total", "status" => status).increment(1);
}

/// Metric: `sfu_room_worker_failures_total` (keepalive failures leading to deletion)
pub fn record_worker_failure() {
    counter!("sfu_room_worker_failures_total").increment(1);
}

/// Metric: `sfu_room_migrations_total`
pub fn record_migration(success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("sfu_room_migrations_total", "status" => status).increment(1);
}

/// Metric: `sfu_room_signaling_forwarded_total`
pub fn record_signaling_forwarded(message_type: &'static str) {
    counter!("sfu_room_signaling_forwarded_total", "type" => message_type).increment(1);
}

/// Metric: `sfu_room_events_total`
pub fn record_event(event: &'static str) {
    counter!("sfu_room_events_total", "event" => event).increment(1);
}

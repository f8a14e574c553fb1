//! Metrics for the session controller.
//!
//! Recorded through the `metrics` facade; the embedding process decides
//! whether and where to export them.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `sfu_session_publishers_active` | Gauge | none |
//! | `sfu_session_subscribers_active` | Gauge | none |
//! | `sfu_session_connection_events_total` | Counter | `role`, `event` |
//! | `sfu_session_candidates_replayed_total` | Counter | none |
//! | `sfu_session_keyframe_requests_total` | Counter | none |
//! | `sfu_session_stats_dropped_total` | Counter | `reason` |
//!
//! Label values are bounded by enums (`role`: 2, `event`: 7, `reason`: 2).

use metrics::{counter, gauge};

/// Metric: `sfu_session_publishers_active`
pub fn set_publishers_active(count: usize) {
    // usize to f64 conversion is safe for realistic publisher counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_session_publishers_active").set(count as f64);
}

/// Metric: `sfu_session_subscribers_active`
pub fn set_subscribers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_session_subscribers_active").set(count as f64);
}

/// Metric: `sfu_session_connection_events_total`
/// Labels: `role` (publisher, subscriber), `event` (engine event name)
pub fn record_connection_event(role: &'static str, event: &'static str) {
    counter!("sfu_session_connection_events_total", "role" => role, "event" => event).increment(1);
}

/// Metric: `sfu_session_candidates_replayed_total`
pub fn record_candidates_replayed(count: usize) {
    counter!("sfu_session_candidates_replayed_total").increment(count as u64);
}

/// Metric: `sfu_session_keyframe_requests_total`
pub fn record_keyframe_request() {
    counter!("sfu_session_keyframe_requests_total").increment(1);
}

/// Metric: `sfu_session_stats_dropped_total`
/// Labels: `reason` (malformed, delivery)
pub fn record_stats_dropped(reason: &'static str) {
    counter!("sfu_session_stats_dropped_total", "reason" => reason).increment(1);
}

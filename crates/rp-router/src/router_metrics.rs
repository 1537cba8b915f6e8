//! Metric names and recording helpers. No exporter is installed here; the
//! embedding process decides where the `metrics` facade reports to.

pub const MESSAGES_ROUTED: &str = "relaypoint_messages_routed_total";
pub const MESSAGES_DELIVERED: &str = "relaypoint_messages_delivered_total";
pub const MESSAGES_DROPPED: &str = "relaypoint_messages_dropped_total";
pub const SEND_RETRIES: &str = "relaypoint_send_retries_total";
pub const MESSAGES_IN_FLIGHT: &str = "relaypoint_messages_in_flight";

pub fn record_routed() {
    metrics::counter!(MESSAGES_ROUTED).increment(1);
}

pub fn record_delivered() {
    metrics::counter!(MESSAGES_DELIVERED).increment(1);
}

pub fn record_dropped(reason: &'static str) {
    metrics::counter!(MESSAGES_DROPPED, "reason" => reason).increment(1);
}

pub fn record_retry() {
    metrics::counter!(SEND_RETRIES).increment(1);
}

pub fn set_in_flight(count: usize) {
    metrics::gauge!(MESSAGES_IN_FLIGHT).set(count as f64);
}

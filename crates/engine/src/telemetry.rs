//! Metric names and recording helpers.
//!
//! Everything goes through the `metrics` facade; the host process decides
//! whether a recorder is installed.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use courier_common::types::Phase;

use crate::circuit_breaker::CircuitState;

pub const NOTIFICATION_REQUESTS: &str = "courier_notification_requests_total";
pub const DELIVERY_ATTEMPTS: &str = "courier_delivery_attempts_total";
pub const DELIVERY_RETRIES: &str = "courier_delivery_retries_total";
pub const AUDIT_EVENTS: &str = "courier_audit_events_total";
pub const CIRCUIT_BREAKER_STATE: &str = "courier_circuit_breaker_state";
pub const DELIVERY_DURATION: &str = "courier_delivery_duration_seconds";
pub const RECONCILE_DURATION: &str = "courier_reconcile_duration_seconds";

/// Register descriptions with whatever recorder is installed.
pub fn describe() {
    describe_counter!(
        NOTIFICATION_REQUESTS,
        "Notification phase transitions, by phase entered"
    );
    describe_counter!(DELIVERY_ATTEMPTS, "Recorded delivery attempts");
    describe_counter!(DELIVERY_RETRIES, "Delivery attempts after the first");
    describe_counter!(AUDIT_EVENTS, "Audit events by disposition");
    describe_gauge!(
        CIRCUIT_BREAKER_STATE,
        "Circuit state per channel: 0=closed, 1=open, 2=half-open"
    );
    describe_histogram!(DELIVERY_DURATION, "Wall time of delivery calls");
    describe_histogram!(RECONCILE_DURATION, "Wall time of reconcile invocations");
}

pub fn record_phase(phase: Phase) {
    counter!(NOTIFICATION_REQUESTS, "phase" => phase.to_string()).increment(1);
}

pub fn record_attempt(channel: &str, outcome: &'static str) {
    counter!(DELIVERY_ATTEMPTS, "channel" => channel.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_retry(channel: &str) {
    counter!(DELIVERY_RETRIES, "channel" => channel.to_string()).increment(1);
}

pub fn record_delivery_duration(channel: &str, elapsed: Duration) {
    histogram!(DELIVERY_DURATION, "channel" => channel.to_string()).record(elapsed.as_secs_f64());
}

pub fn record_reconcile_duration(elapsed: Duration) {
    histogram!(RECONCILE_DURATION).record(elapsed.as_secs_f64());
}

pub fn record_audit(result: &'static str, count: usize) {
    counter!(AUDIT_EVENTS, "result" => result).increment(count as u64);
}

pub fn record_circuit_state(channel: &str, state: CircuitState) {
    gauge!(CIRCUIT_BREAKER_STATE, "channel" => channel.to_string()).set(state.gauge_value());
}

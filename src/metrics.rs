// =============================================================================
// METRICS MODULE
// =============================================================================
// Prometheus metrics for the reservation service, scraped from /metrics.
//
// NOTES:
// - Counters end in _total, durations are histograms in seconds
// - Label values are bounded sets (outcome, status, operation); the only
//   per-entity label is `lot` on the occupancy gauge
// =============================================================================

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// METRIC NAMES
// =============================================================================

/// Labels: method, endpoint, status
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";

/// Labels: method, endpoint
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";

/// Booking attempts. Labels: outcome (created/slot_conflict/no_availability/invalid/failed)
pub const PARKING_RESERVATIONS_TOTAL: &str = "parking_reservations_total";

/// Lifecycle transitions. Labels: to (confirmed/checked_in/completed/cancelled)
pub const PARKING_TRANSITIONS_TOTAL: &str = "parking_transitions_total";

/// Occupied share of a lot's slots at the last occupancy read. Labels: lot
pub const PARKING_LOT_OCCUPANCY_PERCENT: &str = "parking_lot_occupancy_percent";

/// Labels: operation
pub const DB_QUERY_DURATION_SECONDS: &str = "db_query_duration_seconds";

/// Labels: operation (get/set/incr)
pub const REDIS_OPERATION_DURATION_SECONDS: &str = "redis_operation_duration_seconds";

/// Background sweep results. Labels: action (expired/renewed/failed)
pub const PARKING_SWEEPER_ACTIONS_TOTAL: &str = "parking_sweeper_actions_total";

// =============================================================================
// SETUP FUNCTION
// =============================================================================
/// Install the global Prometheus recorder and return its render handle.
pub fn setup_metrics() -> Result<PrometheusHandle> {
    // 1ms .. 10s
    let latency_buckets = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(DB_QUERY_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(REDIS_OPERATION_DURATION_SECONDS.to_string()),
            latency_buckets,
        )?
        .install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request latency in seconds");
    describe_counter!(PARKING_RESERVATIONS_TOTAL, "Reservation attempts by outcome");
    describe_counter!(PARKING_TRANSITIONS_TOTAL, "Reservation status transitions");
    describe_gauge!(
        PARKING_LOT_OCCUPANCY_PERCENT,
        "Percentage of a lot's slots occupied at the last occupancy read"
    );
    describe_histogram!(DB_QUERY_DURATION_SECONDS, "Database query latency in seconds");
    describe_histogram!(REDIS_OPERATION_DURATION_SECONDS, "Redis operation latency in seconds");
    describe_counter!(PARKING_SWEEPER_ACTIONS_TOTAL, "Actions taken by the background sweeper");

    Ok(handle)
}

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

pub fn record_http_request(method: &str, endpoint: &str, status: u16, duration_secs: f64) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "endpoint" => endpoint.to_string()
    )
    .record(duration_secs);
}

pub fn record_reservation_outcome(outcome: &'static str) {
    counter!(PARKING_RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_transition(to: &'static str) {
    counter!(PARKING_TRANSITIONS_TOTAL, "to" => to).increment(1);
}

pub fn set_lot_occupancy(lot: &str, percent: f64) {
    gauge!(PARKING_LOT_OCCUPANCY_PERCENT, "lot" => lot.to_string()).set(percent);
}

pub fn record_db_query(operation: &str, duration_secs: f64) {
    histogram!(
        DB_QUERY_DURATION_SECONDS,
        "operation" => operation.to_string()
    )
    .record(duration_secs);
}

pub fn record_redis_operation(operation: &'static str, duration_secs: f64) {
    histogram!(REDIS_OPERATION_DURATION_SECONDS, "operation" => operation).record(duration_secs);
}

pub fn record_sweeper_action(action: &'static str, count: u64) {
    counter!(PARKING_SWEEPER_ACTIONS_TOTAL, "action" => action).increment(count);
}

//! Metric names and recording helpers for wiregate.
//!
//! Only the `metrics` facade is used here; the embedding application installs
//! whatever recorder/exporter it wants. Without a recorder every call is a no-op.
//!
//! Provided metrics:
//! * `wiregate_connection_attempts_total` (counter)
//! * `wiregate_connections_successful_total` (counter)
//! * `wiregate_connections_failed_total` (counter, label `reason`)
//! * `wiregate_protocol_detected_total` (counter, label `protocol`)
//! * `wiregate_active_connections` (gauge)
//! * `wiregate_relay_bytes_total` (counter, label `direction`)
//! * `wiregate_http_requests_total` (counter, label `status`)
//! * `wiregate_http_request_duration_seconds` (histogram)
//! * `wiregate_discovery_failures_total` (counter)
//! * `wiregate_mapped_paths` (gauge, label `template`)
use std::time::{Duration, Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const WIREGATE_CONNECTION_ATTEMPTS_TOTAL: &str = "wiregate_connection_attempts_total";
pub const WIREGATE_CONNECTIONS_SUCCESSFUL_TOTAL: &str = "wiregate_connections_successful_total";
pub const WIREGATE_CONNECTIONS_FAILED_TOTAL: &str = "wiregate_connections_failed_total"; // labels: reason
pub const WIREGATE_PROTOCOL_DETECTED_TOTAL: &str = "wiregate_protocol_detected_total"; // labels: protocol
pub const WIREGATE_ACTIVE_CONNECTIONS: &str = "wiregate_active_connections";
pub const WIREGATE_RELAY_BYTES_TOTAL: &str = "wiregate_relay_bytes_total"; // labels: direction
pub const WIREGATE_HTTP_REQUESTS_TOTAL: &str = "wiregate_http_requests_total"; // labels: status
pub const WIREGATE_HTTP_REQUEST_DURATION_SECONDS: &str = "wiregate_http_request_duration_seconds";
pub const WIREGATE_DISCOVERY_FAILURES_TOTAL: &str = "wiregate_discovery_failures_total";
pub const WIREGATE_MAPPED_PATHS: &str = "wiregate_mapped_paths"; // labels: template

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        WIREGATE_CONNECTION_ATTEMPTS_TOTAL,
        Unit::Count,
        "Client connections accepted by the gateway."
    );
    describe_counter!(
        WIREGATE_CONNECTIONS_SUCCESSFUL_TOTAL,
        Unit::Count,
        "Client connections that reached a backend."
    );
    describe_counter!(
        WIREGATE_CONNECTIONS_FAILED_TOTAL,
        Unit::Count,
        "Client connections closed before reaching a backend, by reason."
    );
    describe_counter!(
        WIREGATE_PROTOCOL_DETECTED_TOTAL,
        Unit::Count,
        "Connections per detected protocol."
    );
    describe_gauge!(
        WIREGATE_ACTIVE_CONNECTIONS,
        "Client connections currently open (connecting or connected)."
    );
    describe_counter!(
        WIREGATE_RELAY_BYTES_TOTAL,
        Unit::Bytes,
        "Bytes relayed between clients and backends, by direction."
    );
    describe_counter!(
        WIREGATE_HTTP_REQUESTS_TOTAL,
        Unit::Count,
        "HTTP requests handled by the reverse proxy, by status."
    );
    describe_histogram!(
        WIREGATE_HTTP_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests handled by the reverse proxy."
    );
    describe_counter!(
        WIREGATE_DISCOVERY_FAILURES_TOTAL,
        Unit::Count,
        "Discovery polls that failed and kept the previous routing table."
    );
    describe_gauge!(
        WIREGATE_MAPPED_PATHS,
        "Resolved HTTP paths currently mapped to at least one backend."
    );
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIPTIONS);
    tracing::debug!("wiregate metric descriptions registered");
}

pub fn increment_connection_attempts() {
    counter!(WIREGATE_CONNECTION_ATTEMPTS_TOTAL).increment(1);
}

pub fn increment_connections_successful() {
    counter!(WIREGATE_CONNECTIONS_SUCCESSFUL_TOTAL).increment(1);
}

pub fn increment_connections_failed(reason: &'static str) {
    counter!(WIREGATE_CONNECTIONS_FAILED_TOTAL, "reason" => reason).increment(1);
}

pub fn increment_protocol_detected(protocol: &'static str) {
    counter!(WIREGATE_PROTOCOL_DETECTED_TOTAL, "protocol" => protocol).increment(1);
}

pub fn set_active_connections(count: usize) {
    gauge!(WIREGATE_ACTIVE_CONNECTIONS).set(count as f64);
}

/// `direction` is `upstream` (client → backend) or `downstream`.
pub fn add_relay_bytes(direction: &'static str, bytes: u64) {
    counter!(WIREGATE_RELAY_BYTES_TOTAL, "direction" => direction).increment(bytes);
}

pub fn increment_http_requests(status: u16) {
    counter!(WIREGATE_HTTP_REQUESTS_TOTAL, "status" => status.to_string()).increment(1);
}

pub fn record_http_request_duration(duration: Duration) {
    histogram!(WIREGATE_HTTP_REQUEST_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn increment_discovery_failures() {
    counter!(WIREGATE_DISCOVERY_FAILURES_TOTAL).increment(1);
}

pub fn set_mapped_paths(template: &str, count: usize) {
    gauge!(WIREGATE_MAPPED_PATHS, "template" => template.to_string()).set(count as f64);
}

/// RAII helper measuring a proxied HTTP request; records on drop so early
/// returns are covered.
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_http_request_duration(self.start.elapsed());
    }
}

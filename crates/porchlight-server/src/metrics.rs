//! Metrics collection and export for Porchlight.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use porchlight_core::RouterStats;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "porchlight_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "porchlight_connections_active";
    pub const AUTH_FAILURES_TOTAL: &str = "porchlight_auth_failures_total";
    pub const SESSION_TAKEOVERS_TOTAL: &str = "porchlight_session_takeovers_total";
    pub const MESSAGES_TOTAL: &str = "porchlight_messages_total";
    pub const MESSAGES_BYTES: &str = "porchlight_messages_bytes";
    pub const TOPICS_ACTIVE: &str = "porchlight_topics_active";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "porchlight_subscriptions_active";
    pub const MALFORMED_PAYLOADS_TOTAL: &str = "porchlight_malformed_payloads_total";
    pub const NOTIFY_FLASHING: &str = "porchlight_notify_flashing";
    pub const COOLDOWNS_TOTAL: &str = "porchlight_cooldowns_total";
    pub const FLEET_CONNECTED: &str = "porchlight_fleet_connected";
    pub const ERRORS_TOTAL: &str = "porchlight_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Connections refused for bad credentials"
    );
    metrics::describe_counter!(
        names::SESSION_TAKEOVERS_TOTAL,
        "Sessions closed because the same client ID connected again"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total payload bytes processed");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of topics");
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Current number of subscriptions"
    );
    metrics::describe_counter!(
        names::MALFORMED_PAYLOADS_TOTAL,
        "Presence or acknowledgment payloads that failed to parse"
    );
    metrics::describe_gauge!(
        names::NOTIFY_FLASHING,
        "Last published notify signal (1 = flashing)"
    );
    metrics::describe_counter!(names::COOLDOWNS_TOTAL, "Cooldowns started");
    metrics::describe_gauge!(
        names::FLEET_CONNECTED,
        "Monitored buttons currently connected"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a refused CONNECT.
pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES_TOTAL).increment(1);
}

/// Record a session replaced by a newer connection.
pub fn record_takeover() {
    counter!(names::SESSION_TAKEOVERS_TOTAL).increment(1);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Update topic and subscription gauges.
pub fn set_router_stats(stats: &RouterStats) {
    gauge!(names::TOPICS_ACTIVE).set(stats.topic_count as f64);
    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(stats.total_subscriptions as f64);
}

/// Record a payload that could not be parsed.
pub fn record_malformed_payload(topic: &str) {
    counter!(names::MALFORMED_PAYLOADS_TOTAL, "topic" => topic.to_string()).increment(1);
}

/// Record the notify signal that was just published.
pub fn set_notify_signal(flashing: bool) {
    gauge!(names::NOTIFY_FLASHING).set(if flashing { 1.0 } else { 0.0 });
}

/// Record a cooldown start.
pub fn record_cooldown_started(restarted: bool) {
    counter!(names::COOLDOWNS_TOTAL, "restart" => restarted.to_string()).increment(1);
}

/// Update the connected fleet size.
pub fn set_fleet_connected(count: usize) {
    gauge!(names::FLEET_CONNECTED).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

//! Metrics collection and export for Roost.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "roost_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "roost_connections_active";
    pub const MESSAGES_TOTAL: &str = "roost_messages_total";
    pub const MESSAGES_BYTES: &str = "roost_messages_bytes";
    pub const SUBSCRIPTIONS_TOTAL: &str = "roost_subscriptions_total";
    pub const FANOUT_RECIPIENTS: &str = "roost_fanout_recipients";
    pub const ERRORS_TOTAL: &str = "roost_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of PUBLISH messages");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total PUBLISH payload bytes");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of granted subscriptions"
    );
    metrics::describe_histogram!(
        names::FANOUT_RECIPIENTS,
        "Clients a single PUBLISH was delivered to"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of connection errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(host: &str, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

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

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record the outcome of one fan-out.
pub fn record_fanout(recipients: usize, bytes: usize) {
    histogram!(names::FANOUT_RECIPIENTS).record(recipients as f64);
    if recipients > 0 {
        counter!(names::MESSAGES_TOTAL, "direction" => "outbound").increment(recipients as u64);
        counter!(names::MESSAGES_BYTES, "direction" => "outbound")
            .increment((bytes * recipients) as u64);
    }
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
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

//! Metrics collection and export for Huddle.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "huddle_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "huddle_connections_active";
    pub const MESSAGES_TOTAL: &str = "huddle_messages_total";
    pub const FRAMES_BYTES: &str = "huddle_frames_bytes";
    pub const FRAMES_DROPPED: &str = "huddle_frames_dropped_total";
    pub const OUTBOUND_CLOSED: &str = "huddle_outbound_closed_total";
    pub const SEND_SECONDS: &str = "huddle_send_seconds";
    pub const ERRORS_TOTAL: &str = "huddle_errors_total";
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
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Messages stored, by route");
    metrics::describe_counter!(names::FRAMES_BYTES, "Bytes of WebSocket frames, by direction");
    metrics::describe_counter!(
        names::FRAMES_DROPPED,
        "Inbound frames dropped without storing a message, by reason"
    );
    metrics::describe_counter!(
        names::OUTBOUND_CLOSED,
        "Outbound queues closed by the hub while the connection was open"
    );
    metrics::describe_histogram!(
        names::SEND_SECONDS,
        "Time to store and broadcast a message in seconds"
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

/// Record a stored message.
pub fn record_message(route: &'static str) {
    counter!(names::MESSAGES_TOTAL, "route" => route).increment(1);
}

/// Record frame bytes.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an inbound frame that produced no message.
pub fn record_dropped_frame(reason: &'static str) {
    counter!(names::FRAMES_DROPPED, "reason" => reason).increment(1);
}

/// Record the hub closing a live connection's queue.
pub fn record_outbound_closed() {
    counter!(names::OUTBOUND_CLOSED).increment(1);
}

/// Record send latency.
pub fn record_send_latency(seconds: f64) {
    histogram!(names::SEND_SECONDS).record(seconds);
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

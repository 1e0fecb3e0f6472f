//! Metrics collection and export for Junction.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use junction_core::RouterStats;
use junction_transport::telemetry;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "junction_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "junction_connections_active";
    pub const SESSIONS_ACTIVE: &str = "junction_sessions_active";
    pub const REALMS: &str = "junction_realms";
    pub const HANDSHAKE_FAILURES_TOTAL: &str = "junction_handshake_failures_total";
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
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of welcomed sessions");
    metrics::describe_gauge!(names::REALMS, "Number of registered realms");
    metrics::describe_counter!(
        names::HANDSHAKE_FAILURES_TOTAL,
        "Connections that never reached WELCOME"
    );
    metrics::describe_counter!(
        telemetry::MESSAGES_TOTAL,
        "Total number of messages moved through transports"
    );
    metrics::describe_counter!(
        telemetry::DECODE_ERRORS_TOTAL,
        "Frames dropped because they could not be decoded"
    );

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
pub fn record_connection(transport: &'static str) {
    counter!(names::CONNECTIONS_TOTAL, "transport" => transport).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection rejected before WELCOME.
pub fn record_handshake_failure(reason: &'static str) {
    counter!(names::HANDSHAKE_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Publish router statistics as gauges.
pub fn set_router_stats(stats: RouterStats) {
    gauge!(names::SESSIONS_ACTIVE).set(stats.session_count as f64);
    gauge!(names::REALMS).set(stats.realm_count as f64);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new(transport: &'static str) -> Self {
        record_connection(transport);
        Self
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // No recorder installed; recording must be a no-op
        let _guard = ConnectionMetricsGuard::new("websocket");
        record_handshake_failure("timeout");
        set_router_stats(RouterStats {
            realm_count: 1,
            session_count: 0,
        });
    }
}

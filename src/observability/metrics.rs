//! Metrics collection and exposition.
//!
//! # Metrics
//! - `mqttd_connections_accepted_total` (counter): connections admitted, by listener
//! - `mqttd_connections_rejected_total` (counter): connections refused, by listener and reason
//! - `mqttd_listener_clients` (gauge): clients currently held, by listener
//! - `mqttd_reloads_total` (counter): completed reload cycles
//! - `mqttd_cert_reload_failures_total` (counter): TLS contexts that failed to rebuild
//!
//! Without an installed recorder every call here is a no-op.

use std::net::SocketAddr;

use metrics::{counter, gauge, Gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Must be called from inside the tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

#[inline]
pub fn on_connection_accepted(listener: &str) {
    counter!("mqttd_connections_accepted_total", "listener" => listener.to_string()).increment(1);
}

/// `reason` is one of `limit`, `handshake`, `identity`, `core`.
#[inline]
pub fn on_connection_rejected(listener: &str, reason: &'static str) {
    counter!(
        "mqttd_connections_rejected_total",
        "listener" => listener.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Gauge tracking the live client count of one listener.
pub fn listener_clients(listener: &str) -> Gauge {
    gauge!("mqttd_listener_clients", "listener" => listener.to_string())
}

#[inline]
pub fn on_reload() {
    counter!("mqttd_reloads_total").increment(1);
}

#[inline]
pub fn on_cert_reload_failure(listener: &str) {
    counter!("mqttd_cert_reload_failures_total", "listener" => listener.to_string()).increment(1);
}

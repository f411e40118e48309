//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): exchanges by kind, status
//! - `proxy_request_duration_seconds` (histogram): time to the client response head
//! - `proxy_upstream_errors_total` (counter): failed outgoing requests by role, error kind
//! - `proxy_client_resets_total` (counter): clients that went away mid-flight
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - The Prometheus exporter is optional and owned by the binary

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::config::Role;

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_exchange(kind: &'static str, status: u16, started: Instant) {
    counter!("proxy_requests_total", "kind" => kind, "status" => status.to_string()).increment(1);
    histogram!("proxy_request_duration_seconds", "kind" => kind).record(started.elapsed().as_secs_f64());
}

pub fn record_upstream_error(role: Role, kind: &'static str) {
    counter!("proxy_upstream_errors_total", "role" => role.as_str(), "kind" => kind).increment(1);
}

pub fn record_client_reset() {
    counter!("proxy_client_resets_total").increment(1);
}

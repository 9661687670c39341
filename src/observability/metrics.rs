//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): client requests by status
//! - `proxy_request_duration_seconds` (histogram): time to the end of the stream leg
//! - `proxy_leg_duration_seconds` (histogram): per-leg latency by leg and status
//! - `proxy_upstream_failures_total` (counter): by leg and stage
//! - `proxy_comparisons_total` (counter): match / mismatch
//! - `proxy_mismatches_total` (counter): by mismatch kind
//! - `proxy_client_disconnects_total` (counter): fast / early
//! - `proxy_role_switches_total` (counter)
//! - `proxy_dns_refresh_total` (counter): by outcome
//! - `proxy_connections_retired_total` (counter): by reason
//!
//! Method names are not used as labels; they come from clients.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(status: u16, elapsed: Duration) {
    counter!("proxy_requests_total", "status" => status.to_string()).increment(1);
    histogram!("proxy_request_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_leg(leg: &'static str, status: u16, latency: Duration) {
    histogram!("proxy_leg_duration_seconds", "leg" => leg, "status" => status.to_string())
        .record(latency.as_secs_f64());
}

pub fn record_upstream_failure(leg: &'static str, stage: &'static str) {
    counter!("proxy_upstream_failures_total", "leg" => leg, "stage" => stage).increment(1);
}

pub fn record_comparison(outcome: &'static str) {
    counter!("proxy_comparisons_total", "outcome" => outcome).increment(1);
}

pub fn record_mismatch(kind: &'static str) {
    counter!("proxy_mismatches_total", "kind" => kind).increment(1);
}

pub fn record_client_disconnect(category: &'static str) {
    counter!("proxy_client_disconnects_total", "category" => category).increment(1);
}

pub fn record_role_switch() {
    counter!("proxy_role_switches_total").increment(1);
}

pub fn record_dns_refresh(outcome: &'static str) {
    counter!("proxy_dns_refresh_total", "outcome" => outcome).increment(1);
}

pub fn record_connections_retired(reason: &'static str, count: usize) {
    if count > 0 {
        counter!("proxy_connections_retired_total", "reason" => reason).increment(count as u64);
    }
}

//! Metrics collection and exposition.
//!
//! # Metrics
//! - `mesh_requests_total` (counter): requests by service, direction, status
//! - `mesh_request_duration_seconds` (histogram): latency by service, direction
//! - `mesh_breaker_rejections_total` (counter): fast failures by target
//! - `mesh_breaker_state` (gauge): 0=closed, 1=half-open, 2=open
//! - `mesh_instance_health` (gauge): 1=healthy, 0=otherwise
//! - `mesh_registry_instances` (gauge): registered instances per service
//! - `mesh_canary_weight` (gauge): current canary percentage per service
//!
//! The Prometheus recorder is process-wide and installed at most once; every
//! sidecar in the process renders the same registry.

use std::sync::OnceLock;
use std::time::Instant;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::registry::HealthState;
use crate::resilience::BreakerState;

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder if it is not installed yet.
pub fn init_metrics() -> Option<&'static PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                tracing::info!("Prometheus recorder installed");
                Some(handle)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install Prometheus recorder");
                None
            }
        })
        .as_ref()
}

/// Render all metrics in the Prometheus text format.
pub fn render() -> String {
    match init_metrics() {
        Some(handle) => {
            handle.run_upkeep();
            handle.render()
        }
        None => String::new(),
    }
}

pub fn record_request(service: &str, direction: &'static str, status: u16, start: Instant) {
    let latency = start.elapsed().as_secs_f64();
    metrics::counter!(
        "mesh_requests_total",
        "service" => service.to_string(),
        "direction" => direction,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "mesh_request_duration_seconds",
        "service" => service.to_string(),
        "direction" => direction
    )
    .record(latency);
}

pub fn record_breaker_state(target: &str, state: BreakerState) {
    metrics::gauge!("mesh_breaker_state", "target" => target.to_string()).set(state.as_gauge());
}

pub fn record_breaker_rejection(target: &str) {
    metrics::counter!("mesh_breaker_rejections_total", "target" => target.to_string()).increment(1);
}

pub fn record_instance_health(service: &str, instance: &str, health: HealthState) {
    metrics::gauge!(
        "mesh_instance_health",
        "service" => service.to_string(),
        "instance" => instance.to_string()
    )
    .set(health.as_gauge());
}

pub fn record_registry_instances(service: &str, count: usize) {
    metrics::gauge!("mesh_registry_instances", "service" => service.to_string()).set(count as f64);
}

pub fn record_canary_weight(service: &str, weight: u32) {
    metrics::gauge!("mesh_canary_weight", "service" => service.to_string()).set(f64::from(weight));
}

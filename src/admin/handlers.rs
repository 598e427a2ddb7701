use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::admin::AdminState;
use crate::error::{MeshError, Result};
use crate::registry::{HealthState, Protocol, ServiceInstance};
use crate::resilience::BreakerMetrics;
use crate::traffic::TrafficPolicy;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub services: usize,
    pub policies: usize,
}

#[derive(Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub instances: usize,
    pub healthy: usize,
}

/// Body of `POST /admin/services/{name}/instances`.
#[derive(Debug, Deserialize)]
pub struct RegisterInstance {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Body of `PUT /admin/services/{name}/instances/{host}/{port}/health`.
#[derive(Debug, Deserialize)]
pub struct ReportHealth {
    pub health: HealthState,
}

#[derive(Serialize)]
pub struct CanaryWeight {
    pub service: String,
    pub current_weight: u32,
}

#[derive(Serialize)]
pub struct BreakerOverview {
    pub ingress: Option<BreakerMetrics>,
    pub upstreams: Vec<BreakerMetrics>,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        services: state.registry.list_services().len(),
        policies: state.traffic.list_policies().len(),
    })
}

pub async fn list_services(State(state): State<AdminState>) -> Json<Vec<ServiceSummary>> {
    let services = state
        .registry
        .list_services()
        .into_iter()
        .map(|name| {
            let instances = state.registry.get_service_instances(&name);
            ServiceSummary {
                healthy: instances.iter().filter(|i| i.is_healthy()).count(),
                instances: instances.len(),
                name,
            }
        })
        .collect();
    Json(services)
}

pub async fn list_instances(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<ServiceInstance>>> {
    if !state.registry.list_services().contains(&name) {
        return Err(MeshError::ServiceNotFound(name));
    }
    Ok(Json(state.registry.get_service_instances(&name)))
}

pub async fn register_instance(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(body): Json<RegisterInstance>,
) -> Result<(StatusCode, Json<ServiceInstance>)> {
    let mut instance = ServiceInstance::new(name.clone(), body.host, body.port)
        .with_version(body.version)
        .with_protocol(body.protocol);
    instance.metadata = body.metadata;
    let key = instance.key();

    state.registry.register(instance)?;
    tracing::info!(instance = %key, "Instance registered via admin API");

    let record = state
        .registry
        .get_service_instances(&name)
        .into_iter()
        .find(|i| i.host == key.host && i.port == key.port)
        .ok_or(MeshError::ServiceNotFound(name))?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn deregister_instance(
    State(state): State<AdminState>,
    Path((name, host, port)): Path<(String, String, u16)>,
) -> StatusCode {
    state.registry.deregister(&name, &host, port);
    tracing::info!(service = %name, host = %host, port, "Instance deregistered via admin API");
    StatusCode::NO_CONTENT
}

/// Refresh an instance's heartbeat so TTL eviction keeps it.
pub async fn heartbeat_instance(
    State(state): State<AdminState>,
    Path((name, host, port)): Path<(String, String, u16)>,
) -> Result<StatusCode> {
    state.registry.heartbeat(&name, &host, port)?;
    tracing::debug!(service = %name, host = %host, port, "Heartbeat via admin API");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn report_instance_health(
    State(state): State<AdminState>,
    Path((name, host, port)): Path<(String, String, u16)>,
    Json(body): Json<ReportHealth>,
) -> Result<StatusCode> {
    state.registry.report_health(&name, &host, port, body.health)?;
    tracing::info!(service = %name, host = %host, port, health = ?body.health, "Health reported via admin API");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_policies(State(state): State<AdminState>) -> Json<Vec<TrafficPolicy>> {
    Json(
        state
            .traffic
            .list_policies()
            .iter()
            .map(|p| TrafficPolicy::clone(p))
            .collect(),
    )
}

pub async fn get_policy(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<TrafficPolicy>> {
    let policy = state.traffic.get_policy(&name)?;
    Ok(Json(TrafficPolicy::clone(&policy)))
}

pub async fn put_policy(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(policy): Json<TrafficPolicy>,
) -> Result<Json<TrafficPolicy>> {
    if policy.service_name != name {
        return Err(MeshError::InvalidPolicy {
            service: name,
            reason: format!("body names service {}", policy.service_name),
        });
    }
    state.traffic.set_policy(policy)?;
    let stored = state.traffic.get_policy(&name)?;
    Ok(Json(TrafficPolicy::clone(&stored)))
}

pub async fn delete_policy(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.traffic.remove_policy(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn increment_canary(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<CanaryWeight>> {
    let current_weight = state.traffic.increment_canary(&name)?;
    Ok(Json(CanaryWeight {
        service: name,
        current_weight,
    }))
}

pub async fn promote_canary(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<TrafficPolicy>> {
    let policy = state.traffic.promote_canary(&name)?;
    Ok(Json(TrafficPolicy::clone(&policy)))
}

pub async fn get_breakers(State(state): State<AdminState>) -> Json<BreakerOverview> {
    Json(BreakerOverview {
        ingress: state.ingress.as_ref().map(|b| b.metrics()),
        upstreams: state.breakers.snapshot(),
    })
}

//! Admin HTTP API.
//!
//! JSON over HTTP, every route behind bearer-token auth. Registry and
//! traffic errors map to their status codes with an `x-mesh-reason` header.

pub mod auth;
pub mod handlers;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::registry::ServiceRegistry;
use crate::resilience::{BreakerRegistry, CircuitBreaker};
use crate::traffic::TrafficManager;

/// Handles the admin API operates on.
#[derive(Debug, Clone)]
pub struct AdminState {
    pub registry: Arc<ServiceRegistry>,
    pub traffic: Arc<TrafficManager>,
    pub breakers: Arc<BreakerRegistry>,
    pub ingress: Option<Arc<CircuitBreaker>>,
    pub api_key: Arc<str>,
}

#[allow(deprecated)]
pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/services", get(list_services))
        .route(
            "/admin/services/{name}/instances",
            get(list_instances).post(register_instance),
        )
        .route(
            "/admin/services/{name}/instances/{host}/{port}",
            delete(deregister_instance),
        )
        .route(
            "/admin/services/{name}/instances/{host}/{port}/heartbeat",
            post(heartbeat_instance),
        )
        .route(
            "/admin/services/{name}/instances/{host}/{port}/health",
            put(report_instance_health),
        )
        .route("/admin/policies", get(list_policies))
        .route(
            "/admin/policies/{name}",
            get(get_policy).put(put_policy).delete(delete_policy),
        )
        .route("/admin/policies/{name}/canary/increment", post(increment_canary))
        .route("/admin/policies/{name}/canary/promote", post(promote_canary))
        .route("/admin/breakers", get(get_breakers))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AdminState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(address = %addr, "Admin API listening");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

//! Sidecar proxy.
//!
//! # Responsibilities
//! - Own the ingress listener in front of the local application
//! - Admission control through the ingress circuit breaker
//! - Forward admitted requests to the local application with a deadline
//! - Serve `/health` and `/metrics` when metrics are enabled
//! - Optionally own an egress listener routing outbound calls via the mesh
//! - Graceful drain on `stop`

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::Instrument;

use crate::config::{validation::validate_sidecar, SidecarConfig};
use crate::error::{MeshError, Result};
use crate::http::egress::{EgressRouter, MeshClient};
use crate::http::forward::{self, Forwarder};
use crate::http::inflight::{ProxyStats, ProxyStatsSnapshot, RequestTracker};
use crate::http::request::{forward_deadline, request_id, target_service};
use crate::http::response::error_response;
use crate::http::{EGRESS, INGRESS};
use crate::lifecycle::Shutdown;
use crate::observability::{metrics, tracing::RequestTrace};
use crate::registry::ServiceRegistry;
use crate::resilience::{BreakerMetrics, BreakerRegistry, BreakerState, CircuitBreaker};
use crate::traffic::TrafficManager;

/// State shared by every handler of one sidecar.
#[derive(Debug)]
struct ProxyCore {
    config: SidecarConfig,
    local_authority: String,
    request_timeout: Duration,
    ingress_breaker: Arc<CircuitBreaker>,
    egress: Arc<EgressRouter>,
    forwarder: Forwarder,
    tracker: RequestTracker,
    stats: ProxyStats,
}

type SharedCore = Arc<ProxyCore>;

#[derive(Debug)]
struct Running {
    ingress: SocketAddr,
    egress: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Debug, Default)]
enum Phase {
    #[default]
    Idle,
    /// Listeners are being bound; a second `start` is refused.
    Starting,
    Running(Running),
}

/// Listeners bound by `start`, not yet serving.
struct Bound {
    ingress: TcpListener,
    ingress_addr: SocketAddr,
    egress: Option<(TcpListener, SocketAddr)>,
}

/// Snapshot served on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub service: String,
    pub status: &'static str,
    pub breaker: BreakerMetrics,
    pub in_flight: u64,
    pub requests: ProxyStatsSnapshot,
    pub upstreams: Vec<BreakerMetrics>,
}

/// Data-plane entry point for one local service instance.
#[derive(Debug)]
pub struct SidecarProxy {
    core: SharedCore,
    shutdown: Shutdown,
    phase: Mutex<Phase>,
}

impl SidecarProxy {
    /// Validate `config` and wire the ingress breaker and upstream breakers.
    pub fn new(
        config: SidecarConfig,
        registry: Arc<ServiceRegistry>,
        traffic: Arc<TrafficManager>,
    ) -> Result<Self> {
        let errors = validate_sidecar(&config);
        if !errors.is_empty() {
            let message = errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(MeshError::InvalidConfig(message));
        }

        if config.enable_metrics {
            metrics::init_metrics();
        }

        let request_timeout = Duration::from_millis(config.request_timeout_ms);
        let forwarder = Forwarder::new();
        let ingress_breaker = Arc::new(CircuitBreaker::new(
            config.service_name.clone(),
            &config.circuit_breaker,
        ));
        let egress = Arc::new(EgressRouter {
            registry,
            traffic,
            breakers: Arc::new(BreakerRegistry::new(config.circuit_breaker.clone())),
            forwarder: forwarder.clone(),
            request_timeout,
            enable_metrics: config.enable_metrics,
            enable_tracing: config.enable_tracing,
        });
        let local_authority = if config.service_host.contains(':') {
            format!("[{}]:{}", config.service_host, config.service_port)
        } else {
            format!("{}:{}", config.service_host, config.service_port)
        };

        Ok(Self {
            core: Arc::new(ProxyCore {
                config,
                local_authority,
                request_timeout,
                ingress_breaker,
                egress,
                forwarder,
                tracker: RequestTracker::new(),
                stats: ProxyStats::default(),
            }),
            shutdown: Shutdown::new(),
            phase: Mutex::new(Phase::Idle),
        })
    }

    /// Bind the listeners and start serving in the background.
    ///
    /// Returns the bound ingress address. Serving continues until
    /// [`SidecarProxy::stop`].
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut phase = self.phase();
            if !matches!(*phase, Phase::Idle) {
                return Err(MeshError::InvalidConfig("sidecar already started".into()));
            }
            *phase = Phase::Starting;
        }

        // Nothing serves until every listener is bound.
        let bound = match self.bind_listeners().await {
            Ok(bound) => bound,
            Err(e) => {
                *self.phase() = Phase::Idle;
                return Err(e);
            }
        };
        let config = &self.core.config;
        let ingress = bound.ingress_addr;
        let mut tasks = vec![spawn_listener(
            bound.ingress,
            ingress_router(self.core.clone()),
            &self.shutdown,
            INGRESS,
        )];

        let mut egress = None;
        if let Some((listener, addr)) = bound.egress {
            egress = Some(addr);
            tasks.push(spawn_listener(
                listener,
                egress_router(self.core.clone()),
                &self.shutdown,
                EGRESS,
            ));
        }

        tracing::info!(
            service = %config.service_name,
            ingress = %ingress,
            egress = ?egress,
            upstream = %self.core.local_authority,
            "Sidecar started"
        );

        *self.phase() = Phase::Running(Running {
            ingress,
            egress,
            tasks,
        });
        Ok(ingress)
    }

    async fn bind_listeners(&self) -> Result<Bound> {
        let config = &self.core.config;
        let ingress = TcpListener::bind((config.bind_host.as_str(), config.proxy_port)).await?;
        let ingress_addr = ingress.local_addr()?;

        let egress = match config.egress_port {
            Some(port) => {
                let listener = TcpListener::bind((config.bind_host.as_str(), port)).await?;
                let addr = listener.local_addr()?;
                Some((listener, addr))
            }
            None => None,
        };

        Ok(Bound {
            ingress,
            ingress_addr,
            egress,
        })
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stop accepting, let in-flight requests finish, then close.
    ///
    /// Listeners still busy after `timeout` are aborted and
    /// [`MeshError::DrainTimeout`] is returned.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let Running { mut tasks, .. } = {
            let mut phase = self.phase();
            match std::mem::take(&mut *phase) {
                Phase::Running(running) => running,
                other => {
                    *phase = other;
                    return Ok(());
                }
            }
        };

        tracing::info!(
            service = %self.core.config.service_name,
            in_flight = self.core.tracker.active(),
            "Draining sidecar"
        );
        self.shutdown.trigger();

        let drained =
            tokio::time::timeout(timeout, futures_util::future::join_all(tasks.iter_mut())).await;
        if drained.is_err() {
            let in_flight = self.core.tracker.active();
            for task in &tasks {
                task.abort();
            }
            tracing::warn!(in_flight, "Drain deadline exceeded, listeners aborted");
            return Err(MeshError::DrainTimeout(in_flight));
        }

        tracing::info!(service = %self.core.config.service_name, "Sidecar stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.phase(), Phase::Running(_))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.phase() {
            Phase::Running(running) => Some(running.ingress),
            _ => None,
        }
    }

    pub fn egress_addr(&self) -> Option<SocketAddr> {
        match &*self.phase() {
            Phase::Running(running) => running.egress,
            _ => None,
        }
    }

    pub fn config(&self) -> &SidecarConfig {
        &self.core.config
    }

    /// Breaker guarding the local application.
    pub fn ingress_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.core.ingress_breaker
    }

    /// Breakers guarding discovered upstreams.
    pub fn upstream_breakers(&self) -> &Arc<BreakerRegistry> {
        &self.core.egress.breakers
    }

    /// Client for outbound calls sharing this sidecar's upstream breakers.
    pub fn client(&self) -> MeshClient {
        MeshClient::from_router(self.core.egress.clone())
    }

    pub fn in_flight(&self) -> u64 {
        self.core.tracker.active()
    }

    pub fn health_report(&self) -> HealthReport {
        self.core.health_report()
    }
}

impl ProxyCore {
    fn health_report(&self) -> HealthReport {
        let breaker = self.ingress_breaker.metrics();
        let status = match breaker.state {
            BreakerState::Closed => "serving",
            BreakerState::HalfOpen => "recovering",
            BreakerState::Open => "unavailable",
        };
        HealthReport {
            service: self.config.service_name.clone(),
            status,
            breaker,
            in_flight: self.tracker.active(),
            requests: self.stats.snapshot(),
            upstreams: self.egress.breakers.snapshot(),
        }
    }

    async fn forward_ingress(&self, request: Request<Body>, trace: &RequestTrace) -> Response {
        self.stats.record_request();

        let permit = match self.ingress_breaker.try_acquire() {
            Ok(permit) => permit,
            Err(err) => {
                self.stats.record_rejection();
                tracing::debug!(service = %self.config.service_name, "Ingress request rejected");
                return error_response(&err);
            }
        };

        trace.record_upstream(&self.local_authority);
        let deadline = forward_deadline(request.headers(), self.request_timeout);
        let result = self
            .forwarder
            .forward(request, &self.local_authority, deadline)
            .await;

        if forward::is_success(&result) {
            permit.success();
        } else {
            permit.failure();
            self.stats.record_failure();
        }

        match result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    service = %self.config.service_name,
                    upstream = %self.local_authority,
                    error = %err,
                    "Ingress forward failed"
                );
                error_response(&err)
            }
        }
    }
}

fn spawn_listener(
    listener: TcpListener,
    router: Router,
    shutdown: &Shutdown,
    name: &'static str,
) -> JoinHandle<()> {
    let signal = shutdown.signalled();
    tokio::spawn(async move {
        let app = router.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(signal).await {
            tracing::error!(listener = name, error = %e, "Listener failed");
        }
        tracing::debug!(listener = name, "Listener closed");
    })
}

fn with_common_layers(router: Router, enable_tracing: bool) -> Router {
    let router = if enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    };
    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id()),
    )
}

fn ingress_router(core: SharedCore) -> Router {
    let mut router = Router::new();
    if core.config.enable_metrics {
        router = router
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler));
    }
    let enable_tracing = core.config.enable_tracing;
    let router = router
        .route("/", any(ingress_handler))
        .route("/{*path}", any(ingress_handler))
        .with_state(core);
    with_common_layers(router, enable_tracing)
}

fn egress_router(core: SharedCore) -> Router {
    let enable_tracing = core.config.enable_tracing;
    let router = Router::new()
        .route("/", any(egress_handler))
        .route("/{*path}", any(egress_handler))
        .with_state(core);
    with_common_layers(router, enable_tracing)
}

async fn ingress_handler(State(core): State<SharedCore>, request: Request<Body>) -> Response {
    let _guard = core.tracker.track();
    let trace = RequestTrace::start(
        core.config.enable_tracing,
        &request_id(request.headers()),
        INGRESS,
        &core.config.service_name,
    );
    let span = trace.span().clone();
    let response = core.forward_ingress(request, &trace).instrument(span).await;

    let status = response.status().as_u16();
    if core.config.enable_metrics {
        metrics::record_request(&core.config.service_name, INGRESS, status, trace.start_time());
    }
    trace.finish(status);
    response
}

async fn egress_handler(
    State(core): State<SharedCore>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let _guard = core.tracker.track();
    let Some(service) = target_service(request.headers()) else {
        return (StatusCode::BAD_REQUEST, "Host header names no mesh service").into_response();
    };

    match core.egress.dispatch(&service, request, Some(peer.ip())).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn health_handler(State(core): State<SharedCore>) -> Json<HealthReport> {
    Json(core.health_report())
}

async fn metrics_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
        .into_response()
}

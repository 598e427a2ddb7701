//! Outbound mesh calls.
//!
//! # Data Flow
//! ```text
//! (service, request)
//!     → TrafficManager::evaluate (version or no constraint)
//!     → ServiceRegistry::discover_version (healthy instance)
//!     → BreakerRegistry (one breaker per service@version)
//!     → Forwarder (deadline)
//!     → permit resolved, canary stats recorded
//! ```
//!
//! The same path serves the egress listener and [`MeshClient`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response},
};
use tracing::Instrument;

use crate::error::{MeshError, Result};
use crate::http::forward::{self, Forwarder};
use crate::http::request::{ensure_request_id, forward_deadline, request_id};
use crate::http::EGRESS;
use crate::observability::{metrics, tracing::RequestTrace};
use crate::registry::ServiceRegistry;
use crate::resilience::BreakerRegistry;
use crate::traffic::{RequestContext, TrafficManager};

#[derive(Debug)]
pub(crate) struct EgressRouter {
    pub(crate) registry: Arc<ServiceRegistry>,
    pub(crate) traffic: Arc<TrafficManager>,
    pub(crate) breakers: Arc<BreakerRegistry>,
    pub(crate) forwarder: Forwarder,
    pub(crate) request_timeout: Duration,
    pub(crate) enable_metrics: bool,
    pub(crate) enable_tracing: bool,
}

impl EgressRouter {
    /// Route one outbound request, with metrics and span bookkeeping.
    pub(crate) async fn dispatch(
        &self,
        service: &str,
        request: Request<Body>,
        source_ip: Option<IpAddr>,
    ) -> Result<Response<Body>> {
        let trace = RequestTrace::start(
            self.enable_tracing,
            &request_id(request.headers()),
            EGRESS,
            service,
        );
        let span = trace.span().clone();
        let result = self.route(service, request, source_ip, &trace).instrument(span).await;

        let status = match &result {
            Ok(response) => response.status().as_u16(),
            Err(err) => err.status_code().as_u16(),
        };
        if self.enable_metrics {
            metrics::record_request(service, EGRESS, status, trace.start_time());
        }
        trace.finish(status);
        result
    }

    async fn route(
        &self,
        service: &str,
        request: Request<Body>,
        source_ip: Option<IpAddr>,
        trace: &RequestTrace,
    ) -> Result<Response<Body>> {
        let decision = self
            .traffic
            .evaluate(service, &RequestContext::new(request.headers(), source_ip));
        trace.record_route(decision.version.as_deref(), decision.strategy.as_str());

        let instance = self
            .registry
            .discover_version(service, decision.version.as_deref())?;
        let version = Some(instance.version.as_str()).filter(|v| !v.is_empty());

        let breaker = self.breakers.breaker_for(service, version);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(err) => {
                tracing::debug!(breaker = %breaker.target(), "Egress request rejected");
                return Err(err);
            }
        };

        let authority = instance.authority();
        trace.record_upstream(&authority);
        tracing::debug!(
            service,
            version = ?version,
            strategy = decision.strategy.as_str(),
            upstream = %authority,
            "Forwarding egress request"
        );

        let deadline = forward_deadline(request.headers(), self.request_timeout);
        let result = self.forwarder.forward(request, &authority, deadline).await;
        let ok = forward::is_success(&result);
        if ok {
            permit.success();
        } else {
            permit.failure();
            if let Err(e) = &result {
                tracing::warn!(service, upstream = %authority, error = %e, "Egress forward failed");
            }
        }
        if let Some(version) = version {
            self.traffic.record_outcome(service, version, ok);
        }
        result
    }
}

/// Library entry point for calling other mesh services.
///
/// Shares the registry, traffic manager and upstream breakers with the
/// sidecar that created it.
#[derive(Debug, Clone)]
pub struct MeshClient {
    router: Arc<EgressRouter>,
}

impl MeshClient {
    /// A standalone client with its own upstream breakers.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        traffic: Arc<TrafficManager>,
        breakers: Arc<BreakerRegistry>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            router: Arc::new(EgressRouter {
                registry,
                traffic,
                breakers,
                forwarder: Forwarder::new(),
                request_timeout,
                enable_metrics: false,
                enable_tracing: false,
            }),
        }
    }

    pub(crate) fn from_router(router: Arc<EgressRouter>) -> Self {
        Self { router }
    }

    /// Send `request` to a healthy instance of `service`.
    ///
    /// The request URI only contributes its path and query.
    pub async fn send(&self, service: &str, mut request: Request<Body>) -> Result<Response<Body>> {
        ensure_request_id(request.headers_mut());
        self.router.dispatch(service, request, None).await
    }

    /// `GET path` on `service`.
    pub async fn get(&self, service: &str, path: &str) -> Result<Response<Body>> {
        let request = Request::get(path)
            .body(Body::empty())
            .map_err(|e| MeshError::Forward {
                target: service.to_string(),
                reason: e.to_string(),
            })?;
        self.send(service, request).await
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.router.breakers
    }
}

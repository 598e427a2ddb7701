//! Error taxonomy for the mesh core.
//!
//! Registry and traffic errors are returned to the caller of the admin or
//! discovery API and never retried internally. Breaker rejections and
//! forward failures are turned into fast HTTP failures by the sidecar.

use axum::http::StatusCode;

/// Errors produced by the registry, traffic manager, breakers and proxy.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// The service name has never been registered.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// The service is known but none of its instances is healthy.
    #[error("no healthy instance for service {0}")]
    NoHealthyInstance(String),

    /// A strict-mode registration conflicts with an existing version.
    #[error("instance {service}@{host}:{port} already registered with version {existing}")]
    DuplicateInstance {
        service: String,
        host: String,
        port: u16,
        existing: String,
    },

    /// No traffic policy exists for the service.
    #[error("no traffic policy for service {0}")]
    PolicyNotFound(String),

    /// Canary step or promotion requested without an active canary.
    #[error("no active canary configured for service {0}")]
    NoCanaryConfigured(String),

    /// The policy failed validation and was not applied.
    #[error("invalid traffic policy for {service}: {reason}")]
    InvalidPolicy { service: String, reason: String },

    /// Admission rejected by a circuit breaker.
    #[error("circuit open for {0}")]
    BreakerOpen(String),

    /// Transport failure while proxying to an upstream.
    #[error("forward to {target} failed: {reason}")]
    Forward { target: String, reason: String },

    /// The upstream did not answer before the request deadline.
    #[error("forward to {0} timed out")]
    ForwardTimeout(String),

    /// Sidecar or registry configuration rejected at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// In-flight requests were still running when the drain deadline hit.
    #[error("drain deadline exceeded with {0} requests in flight")]
    DrainTimeout(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// HTTP status used when the error is surfaced through a listener.
    pub fn status_code(&self) -> StatusCode {
        match self {
            MeshError::ServiceNotFound(_) | MeshError::PolicyNotFound(_) => StatusCode::NOT_FOUND,
            MeshError::NoHealthyInstance(_) | MeshError::BreakerOpen(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            MeshError::DuplicateInstance { .. } | MeshError::NoCanaryConfigured(_) => {
                StatusCode::CONFLICT
            }
            MeshError::InvalidPolicy { .. } | MeshError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            MeshError::Forward { .. } => StatusCode::BAD_GATEWAY,
            MeshError::ForwardTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            MeshError::DrainTimeout(_) | MeshError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable reason, sent as `x-mesh-reason`.
    pub fn reason(&self) -> &'static str {
        match self {
            MeshError::ServiceNotFound(_) => "service-not-found",
            MeshError::NoHealthyInstance(_) => "no-healthy-instance",
            MeshError::DuplicateInstance { .. } => "duplicate-instance",
            MeshError::PolicyNotFound(_) => "policy-not-found",
            MeshError::NoCanaryConfigured(_) => "no-canary",
            MeshError::InvalidPolicy { .. } => "invalid-policy",
            MeshError::BreakerOpen(_) => "circuit-open",
            MeshError::Forward { .. } => "forward-failed",
            MeshError::ForwardTimeout(_) => "forward-timeout",
            MeshError::InvalidConfig(_) => "invalid-config",
            MeshError::DrainTimeout(_) => "drain-timeout",
            MeshError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

//! Sidecar data plane.
//!
//! # Data Flow
//! ```text
//! Ingress (proxy_port):
//!     → request id layers
//!     → server.rs (ingress breaker admission)
//!     → forward.rs (local application, deadline)
//!     → permit resolved, counters updated
//!
//! Egress (egress_port or MeshClient):
//!     → egress.rs (version → instance → upstream breaker)
//!     → forward.rs (discovered instance, deadline)
//!     → permit resolved, canary outcome recorded
//! ```

pub mod egress;
pub mod forward;
pub mod inflight;
pub mod request;
pub mod response;
pub mod server;

pub use egress::MeshClient;
pub use request::{X_MESH_TIMEOUT_MS, X_REQUEST_ID};
pub use response::X_MESH_REASON;
pub use server::{HealthReport, SidecarProxy};

/// Direction label for requests entering the local application.
pub const INGRESS: &str = "ingress";

/// Direction label for requests leaving it.
pub const EGRESS: &str = "egress";

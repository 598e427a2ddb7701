//! Service mesh core: registry, circuit breakers, traffic policies and a
//! sidecar proxy tying them together.

pub mod admin;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod registry;
pub mod resilience;
pub mod traffic;

pub use config::schema::MeshConfig;
pub use error::{MeshError, Result};
pub use http::{MeshClient, SidecarProxy};
pub use lifecycle::Shutdown;
pub use registry::{ServiceInstance, ServiceRegistry};
pub use resilience::{BreakerRegistry, CircuitBreaker};
pub use traffic::{TrafficManager, TrafficPolicy};

//! Service registry subsystem.
//!
//! # Data Flow
//! ```text
//! register / deregister / report_health / heartbeat (admin, health monitor)
//!     → service_registry.rs (DashMap<service, instances>, whole-record swaps)
//!
//! discover(service, version)
//!     → healthy + version-matching subset
//!     → load_balancer (round-robin or random)
//!     → Arc<ServiceInstance>
//! ```
//!
//! # Design Decisions
//! - Single process, in memory, nothing persisted
//! - A service name stays known after its last instance leaves
//! - Unknown health is not routable; the first successful probe promotes it

pub mod instance;
pub mod service_registry;

pub use instance::{HealthState, InstanceKey, Protocol, ServiceInstance};
pub use service_registry::ServiceRegistry;

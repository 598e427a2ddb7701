//! Instance selection for discovery.
//!
//! # Data Flow
//! ```text
//! discover(service, version)
//!     → registry collects the healthy, version-matching instances
//!     → Apply selection algorithm:
//!         - round_robin.rs (rotate through instances)
//!         - random.rs (uniform pick)
//!     → Return instance or None
//! ```
//!
//! # Design Decisions
//! - One balancer per service, so rotation is independent across services
//! - Balancers only see eligible instances; health filtering is the registry's job

pub mod random;
pub mod round_robin;

use std::sync::Arc;

use crate::config::SelectionStrategy;
use crate::registry::ServiceInstance;

/// Picks one instance out of an eligible set.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    fn next_instance(&self, candidates: &[Arc<ServiceInstance>]) -> Option<Arc<ServiceInstance>>;
}

/// Build the balancer for a configured strategy.
pub fn for_strategy(strategy: SelectionStrategy) -> Box<dyn LoadBalancer> {
    match strategy {
        SelectionStrategy::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        SelectionStrategy::Random => Box::new(random::Random),
    }
}

//! Uniform random selection.

use std::sync::Arc;

use crate::load_balancer::LoadBalancer;
use crate::registry::ServiceInstance;

#[derive(Debug, Default)]
pub struct Random;

impl LoadBalancer for Random {
    fn next_instance(&self, candidates: &[Arc<ServiceInstance>]) -> Option<Arc<ServiceInstance>> {
        if candidates.is_empty() {
            return None;
        }
        Some(Arc::clone(&candidates[fastrand::usize(..candidates.len())]))
    }
}

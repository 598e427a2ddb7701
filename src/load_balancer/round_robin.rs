//! Round-robin selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::LoadBalancer;
use crate::registry::ServiceInstance;

/// Round-robin selector.
/// Stores an internal counter to rotate through instances.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_instance(&self, candidates: &[Arc<ServiceInstance>]) -> Option<Arc<ServiceInstance>> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(&candidates[index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let i1 = Arc::new(ServiceInstance::new("users", "10.0.0.1", 8080));
        let i2 = Arc::new(ServiceInstance::new("users", "10.0.0.2", 8080));
        let instances = vec![i1.clone(), i2.clone()];

        let s1 = lb.next_instance(&instances).unwrap();
        assert_eq!(s1.host, i1.host);

        let s2 = lb.next_instance(&instances).unwrap();
        assert_eq!(s2.host, i2.host);

        let s3 = lb.next_instance(&instances).unwrap();
        assert_eq!(s3.host, i1.host);
    }

    #[test]
    fn empty_set_yields_none() {
        assert!(RoundRobin::new().next_instance(&[]).is_none());
    }
}

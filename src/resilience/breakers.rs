//! Per-upstream circuit breakers.
//!
//! One breaker per resolved `service@version` target, created lazily on the
//! first egress call. The ingress breaker of a sidecar is never stored here.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::CircuitBreakerConfig;
use crate::resilience::circuit_breaker::{BreakerMetrics, CircuitBreaker};

#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Key used for an upstream target. An empty version means unconstrained.
    pub fn target_key(service: &str, version: Option<&str>) -> String {
        match version {
            Some(v) if !v.is_empty() => format!("{}@{}", service, v),
            _ => service.to_string(),
        }
    }

    /// Get or create the breaker guarding `service@version`.
    pub fn breaker_for(&self, service: &str, version: Option<&str>) -> Arc<CircuitBreaker> {
        let key = Self::target_key(service, version);
        if let Some(existing) = self.breakers.get(&key) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(breaker = %key, "Creating upstream circuit breaker");
                Arc::new(CircuitBreaker::new(key.clone(), &self.config))
            })
            .value()
            .clone()
    }

    pub fn get(&self, service: &str, version: Option<&str>) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .get(&Self::target_key(service, version))
            .map(|b| Arc::clone(b.value()))
    }

    /// Metrics for every known upstream, sorted by target.
    pub fn snapshot(&self) -> Vec<BreakerMetrics> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.value().metrics()).collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

//! Traffic policy store and version selection.
//!
//! # Responsibilities
//! - Hold one policy per logical service
//! - Swap policies atomically: evaluation always reads one whole policy
//! - Evaluate A/B → canary → split → default for each request
//! - Step and promote canaries on explicit request
//! - Keep per-version outcome counters for canary progression

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use axum::http::HeaderMap;
use dashmap::DashMap;
use serde::Serialize;

use crate::error::{MeshError, Result};
use crate::observability::metrics;
use crate::traffic::policy::{Strategy, StrategyKind, TrafficPolicy};
use crate::traffic::select::{self, RequestContext};

type PolicyTable = HashMap<String, Arc<TrafficPolicy>>;

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    /// Selected version; `None` means no version constraint.
    pub version: Option<String>,
    pub strategy: StrategyKind,
}

impl RoutingDecision {
    fn unconstrained() -> Self {
        Self {
            version: None,
            strategy: StrategyKind::Default,
        }
    }
}

#[derive(Debug, Default)]
struct VersionCounters {
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Cumulative outcomes observed for one service version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VersionStats {
    pub successes: u64,
    pub failures: u64,
}

impl VersionStats {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    /// Outcomes recorded since `earlier`.
    pub fn since(&self, earlier: &VersionStats) -> VersionStats {
        VersionStats {
            successes: self.successes.saturating_sub(earlier.successes),
            failures: self.failures.saturating_sub(earlier.failures),
        }
    }

    pub fn success_rate(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.successes as f64 / total as f64),
        }
    }
}

/// Policy store shared by the sidecar, admin API and canary progressor.
#[derive(Debug)]
pub struct TrafficManager {
    policies: ArcSwap<PolicyTable>,
    /// Serializes read-modify-write admin operations. Readers never take it.
    write_lock: Mutex<()>,
    stats: DashMap<(String, String), VersionCounters>,
}

impl Default for TrafficManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficManager {
    pub fn new() -> Self {
        Self {
            policies: ArcSwap::from_pointee(HashMap::new()),
            write_lock: Mutex::new(()),
            stats: DashMap::new(),
        }
    }

    fn writer(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a table where `service` maps to `policy` (or is removed).
    fn publish(&self, service: &str, policy: Option<Arc<TrafficPolicy>>) {
        let current = self.policies.load_full();
        let mut next: PolicyTable = (*current).clone();
        match policy {
            Some(p) => {
                next.insert(service.to_string(), p);
            }
            None => {
                next.remove(service);
            }
        }
        self.policies.store(Arc::new(next));
    }

    /// Install or replace the policy for `policy.service_name`.
    pub fn set_policy(&self, policy: TrafficPolicy) -> Result<()> {
        policy.validate().map_err(|reason| MeshError::InvalidPolicy {
            service: policy.service_name.clone(),
            reason,
        })?;

        let _guard = self.writer();
        let service = policy.service_name.clone();
        let strategy = policy.active_strategy().kind();
        if let Some(canary) = policy.active_canary() {
            metrics::record_canary_weight(&service, canary.current_weight);
        }
        self.publish(&service, Some(Arc::new(policy)));

        tracing::info!(service = %service, strategy = strategy.as_str(), "Traffic policy applied");
        Ok(())
    }

    pub fn get_policy(&self, service: &str) -> Result<Arc<TrafficPolicy>> {
        self.policies
            .load()
            .get(service)
            .cloned()
            .ok_or_else(|| MeshError::PolicyNotFound(service.to_string()))
    }

    /// Every policy, sorted by service name.
    pub fn list_policies(&self) -> Vec<Arc<TrafficPolicy>> {
        let mut all: Vec<_> = self.policies.load().values().cloned().collect();
        all.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        all
    }

    pub fn remove_policy(&self, service: &str) -> Result<()> {
        let _guard = self.writer();
        if !self.policies.load().contains_key(service) {
            return Err(MeshError::PolicyNotFound(service.to_string()));
        }
        self.publish(service, None);
        tracing::info!(service = %service, "Traffic policy removed");
        Ok(())
    }

    /// Choose the version that should serve a request.
    ///
    /// `None` means the service has no policy or the policy imposes no
    /// version constraint.
    pub fn select_version(
        &self,
        service: &str,
        headers: &HeaderMap,
        source_ip: Option<IpAddr>,
    ) -> Option<String> {
        self.evaluate(service, &RequestContext::new(headers, source_ip))
            .version
    }

    /// Evaluate the service's policy, reporting which strategy decided.
    pub fn evaluate(&self, service: &str, ctx: &RequestContext<'_>) -> RoutingDecision {
        // Hold one snapshot of the policy for the whole evaluation.
        let Some(policy) = self.policies.load().get(service).cloned() else {
            return RoutingDecision::unconstrained();
        };

        let strategy = policy.active_strategy();
        let version = match strategy {
            Strategy::AbTest(ab) => Some(select::select_ab(service, ab, ctx)),
            Strategy::Canary(canary) => Some(select::select_canary(canary)),
            Strategy::Split(splits) => select::select_split(splits),
            Strategy::Default => None,
        };

        RoutingDecision {
            version,
            strategy: strategy.kind(),
        }
    }

    /// Raise the canary weight by one step, capped at `max_weight`.
    ///
    /// Returns the weight in effect afterwards. At the cap this is a no-op.
    pub fn increment_canary(&self, service: &str) -> Result<u32> {
        let _guard = self.writer();
        let current = self
            .policies
            .load()
            .get(service)
            .cloned()
            .ok_or_else(|| MeshError::NoCanaryConfigured(service.to_string()))?;
        let canary = current
            .active_canary()
            .ok_or_else(|| MeshError::NoCanaryConfigured(service.to_string()))?;

        if canary.at_max() {
            return Ok(canary.current_weight);
        }

        let weight = canary
            .current_weight
            .saturating_add(canary.increment_step)
            .min(canary.max_weight);

        let mut next = (*current).clone();
        if let Some(c) = next.canary.as_mut() {
            c.current_weight = weight;
        }
        self.publish(service, Some(Arc::new(next)));

        tracing::info!(
            service = %service,
            new_version = %canary.new_version,
            weight,
            max_weight = canary.max_weight,
            "Canary weight increased"
        );
        metrics::record_canary_weight(service, weight);
        Ok(weight)
    }

    /// Make the canary's new version the stable one and end the rollout.
    pub fn promote_canary(&self, service: &str) -> Result<Arc<TrafficPolicy>> {
        let _guard = self.writer();
        let current = self
            .policies
            .load()
            .get(service)
            .cloned()
            .ok_or_else(|| MeshError::NoCanaryConfigured(service.to_string()))?;
        if current.active_canary().is_none() {
            return Err(MeshError::NoCanaryConfigured(service.to_string()));
        }

        let mut next = (*current).clone();
        let mut promoted = String::new();
        if let Some(c) = next.canary.as_mut() {
            promoted = c.new_version.clone();
            c.stable_version = c.new_version.clone();
            c.enabled = false;
            c.current_weight = 0;
        }
        let next = Arc::new(next);
        self.publish(service, Some(Arc::clone(&next)));

        tracing::info!(service = %service, version = %promoted, "Canary promoted to stable");
        metrics::record_canary_weight(service, 0);
        Ok(next)
    }

    /// Record the outcome of a request served by `service@version`.
    pub fn record_outcome(&self, service: &str, version: &str, success: bool) {
        let key = (service.to_string(), version.to_string());
        let counters = self.stats.entry(key).or_default();
        if success {
            counters.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn version_stats(&self, service: &str, version: &str) -> VersionStats {
        self.stats
            .get(&(service.to_string(), version.to_string()))
            .map(|c| VersionStats {
                successes: c.successes.load(Ordering::Relaxed),
                failures: c.failures.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::policy::{AbTestConfig, CanaryConfig, WeightedVersion};
    use axum::http::HeaderValue;

    fn canary_policy() -> TrafficPolicy {
        TrafficPolicy::new("users").with_canary(CanaryConfig::new("v1", "v2"))
    }

    #[test]
    fn canary_increments_are_capped() {
        let tm = TrafficManager::new();
        tm.set_policy(canary_policy()).unwrap();

        for _ in 0..5 {
            tm.increment_canary("users").unwrap();
        }
        assert_eq!(tm.get_policy("users").unwrap().canary.as_ref().unwrap().current_weight, 60);
        assert_eq!(tm.increment_canary("users").unwrap(), 70);

        for _ in 0..20 {
            assert!(tm.increment_canary("users").unwrap() <= 100);
        }
        assert_eq!(tm.get_policy("users").unwrap().canary.as_ref().unwrap().current_weight, 100);
    }

    #[test]
    fn increment_respects_lower_cap() {
        let tm = TrafficManager::new();
        tm.set_policy(TrafficPolicy::new("users").with_canary(CanaryConfig {
            current_weight: 5,
            increment_step: 20,
            max_weight: 30,
            ..CanaryConfig::new("v1", "v2")
        }))
        .unwrap();

        assert_eq!(tm.increment_canary("users").unwrap(), 25);
        assert_eq!(tm.increment_canary("users").unwrap(), 30);
        assert_eq!(tm.increment_canary("users").unwrap(), 30);
    }

    #[test]
    fn increment_without_canary_fails() {
        let tm = TrafficManager::new();
        assert!(matches!(tm.increment_canary("users"), Err(MeshError::NoCanaryConfigured(_))));

        tm.set_policy(TrafficPolicy::new("users")).unwrap();
        assert!(matches!(tm.increment_canary("users"), Err(MeshError::NoCanaryConfigured(_))));
        assert!(matches!(tm.promote_canary("users"), Err(MeshError::NoCanaryConfigured(_))));
    }

    #[test]
    fn promote_ends_rollout() {
        let tm = TrafficManager::new();
        tm.set_policy(canary_policy()).unwrap();
        tm.increment_canary("users").unwrap();

        let promoted = tm.promote_canary("users").unwrap();
        let canary = promoted.canary.as_ref().unwrap();
        assert_eq!(canary.stable_version, "v2");
        assert!(!canary.enabled);
        assert_eq!(canary.current_weight, 0);

        assert!(matches!(tm.increment_canary("users"), Err(MeshError::NoCanaryConfigured(_))));
        assert!(matches!(tm.promote_canary("users"), Err(MeshError::NoCanaryConfigured(_))));
    }

    #[test]
    fn ab_assignment_is_sticky() {
        let tm = TrafficManager::new();
        tm.set_policy(
            TrafficPolicy::new("users").with_ab_test(AbTestConfig::new("v1", "v2", "X-User-Cohort")),
        )
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-user-cohort", HeaderValue::from_static("cohort-42"));
        let first = tm.select_version("users", &headers, None).unwrap();
        for _ in 0..100 {
            assert_eq!(tm.select_version("users", &headers, None).unwrap(), first);
        }
    }

    #[test]
    fn ab_distribution_follows_weights() {
        let tm = TrafficManager::new();
        tm.set_policy(TrafficPolicy::new("users").with_ab_test(AbTestConfig {
            weight_a: 70,
            weight_b: 30,
            ..AbTestConfig::new("v1", "v2", "X-User-Cohort")
        }))
        .unwrap();

        let mut a = 0;
        for i in 0..2000 {
            let mut headers = HeaderMap::new();
            headers.insert("x-user-cohort", HeaderValue::from_str(&format!("user-{}", i)).unwrap());
            if tm.select_version("users", &headers, None).as_deref() == Some("v1") {
                a += 1;
            }
        }
        assert!((1250..=1550).contains(&a), "v1 got {} of 2000", a);
    }

    #[test]
    fn ab_falls_back_to_source_ip() {
        let tm = TrafficManager::new();
        tm.set_policy(
            TrafficPolicy::new("users").with_ab_test(AbTestConfig::new("v1", "v2", "X-User-Cohort")),
        )
        .unwrap();

        let headers = HeaderMap::new();
        let ip: IpAddr = "192.168.7.20".parse().unwrap();
        let first = tm.select_version("users", &headers, Some(ip));
        for _ in 0..50 {
            assert_eq!(tm.select_version("users", &headers, Some(ip)), first);
        }
    }

    #[test]
    fn static_split_frequency() {
        let tm = TrafficManager::new();
        tm.set_policy(TrafficPolicy::new("user-service").with_splits(vec![
            WeightedVersion::new("v1", 80),
            WeightedVersion::new("v2", 20),
        ]))
        .unwrap();

        let headers = HeaderMap::new();
        let v2 = (0..1000)
            .filter(|_| tm.select_version("user-service", &headers, None).as_deref() == Some("v2"))
            .count();
        assert!((130..=270).contains(&v2), "v2 selected {} times", v2);
    }

    #[test]
    fn no_policy_means_no_constraint() {
        let tm = TrafficManager::new();
        let decision = tm.evaluate("users", &RequestContext::new(&HeaderMap::new(), None));
        assert_eq!(decision.version, None);
        assert_eq!(decision.strategy, StrategyKind::Default);
    }

    #[test]
    fn invalid_policy_is_not_applied() {
        let tm = TrafficManager::new();
        let err = tm
            .set_policy(TrafficPolicy::new("users").with_splits(vec![WeightedVersion::new("", 1)]))
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidPolicy { .. }));
        assert!(tm.get_policy("users").is_err());
    }

    #[test]
    fn remove_and_list() {
        let tm = TrafficManager::new();
        tm.set_policy(TrafficPolicy::new("b")).unwrap();
        tm.set_policy(TrafficPolicy::new("a")).unwrap();
        let names: Vec<_> = tm.list_policies().iter().map(|p| p.service_name.clone()).collect();
        assert_eq!(names, ["a", "b"]);

        tm.remove_policy("a").unwrap();
        assert!(matches!(tm.remove_policy("a"), Err(MeshError::PolicyNotFound(_))));
        assert_eq!(tm.list_policies().len(), 1);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let tm = Arc::new(TrafficManager::new());
        tm.set_policy(TrafficPolicy::new("users").with_canary(CanaryConfig {
            current_weight: 0,
            increment_step: 1,
            ..CanaryConfig::new("v1", "v2")
        }))
        .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tm = Arc::clone(&tm);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        tm.increment_canary("users").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tm.get_policy("users").unwrap().canary.as_ref().unwrap().current_weight, 40);
    }

    #[test]
    fn outcome_counters() {
        let tm = TrafficManager::new();
        tm.record_outcome("users", "v2", true);
        tm.record_outcome("users", "v2", true);
        tm.record_outcome("users", "v2", false);

        let stats = tm.version_stats("users", "v2");
        assert_eq!(stats.total(), 3);
        assert!((stats.success_rate().unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(tm.version_stats("users", "v1").success_rate(), None);
    }
}

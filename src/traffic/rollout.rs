//! Automatic canary progression.
//!
//! Every tick, each policy with an active canary below its cap is checked:
//! once `increment_delay_ms` has passed since the last step and the new
//! version has at least `min_samples` outcomes in that window with a success
//! ratio of `min_success_rate` or better, the weight is stepped. A window
//! that misses the ratio is discarded and the weight holds. Promotion is
//! never automatic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::CanaryProgressionConfig;
use crate::traffic::manager::{TrafficManager, VersionStats};

/// Evaluation window for one rollout.
#[derive(Debug, Clone)]
struct Window {
    stable_version: String,
    new_version: String,
    started: Instant,
    baseline: VersionStats,
}

/// What a progression pass did for one service.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Stepped { service: String, weight: u32 },
    Held { service: String, success_rate: f64 },
}

pub struct CanaryProgressor {
    traffic: Arc<TrafficManager>,
    config: CanaryProgressionConfig,
    windows: HashMap<String, Window>,
}

impl CanaryProgressor {
    pub fn new(traffic: Arc<TrafficManager>, config: CanaryProgressionConfig) -> Self {
        Self {
            traffic,
            config,
            windows: HashMap::new(),
        }
    }

    /// Run the progression loop on the current runtime until shutdown.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(tick_ms = self.config.tick_ms, min_samples = self.config.min_samples, "Canary progressor starting");
        let mut ticker = time::interval(Duration::from_millis(self.config.tick_ms.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate(Instant::now());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Canary progressor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// One progression pass over every policy.
    pub fn evaluate(&mut self, now: Instant) -> Vec<StepOutcome> {
        let mut outcomes = Vec::new();
        let mut active = Vec::new();

        for policy in self.traffic.list_policies() {
            let Some(canary) = policy.active_canary() else {
                continue;
            };
            if canary.at_max() {
                continue;
            }
            let service = policy.service_name.clone();
            active.push(service.clone());

            let stats = self.traffic.version_stats(&service, &canary.new_version);
            let window = self
                .windows
                .entry(service.clone())
                .or_insert_with(|| Window {
                    stable_version: canary.stable_version.clone(),
                    new_version: canary.new_version.clone(),
                    started: now,
                    baseline: stats,
                });

            // A different rollout under the same service starts over.
            if window.stable_version != canary.stable_version || window.new_version != canary.new_version {
                *window = Window {
                    stable_version: canary.stable_version.clone(),
                    new_version: canary.new_version.clone(),
                    started: now,
                    baseline: stats,
                };
                continue;
            }

            if now.saturating_duration_since(window.started) < Duration::from_millis(canary.increment_delay_ms) {
                continue;
            }
            let observed = stats.since(&window.baseline);
            if observed.total() < self.config.min_samples.max(1) {
                continue;
            }
            let rate = observed.success_rate().unwrap_or(0.0);

            window.started = now;
            window.baseline = stats;

            if rate < canary.min_success_rate {
                tracing::warn!(
                    service = %service,
                    version = %canary.new_version,
                    success_rate = rate,
                    required = canary.min_success_rate,
                    "Canary below success threshold, holding weight"
                );
                outcomes.push(StepOutcome::Held { service, success_rate: rate });
                continue;
            }

            match self.traffic.increment_canary(&service) {
                Ok(weight) => outcomes.push(StepOutcome::Stepped { service, weight }),
                Err(e) => tracing::warn!(service = %service, error = %e, "Canary step rejected"),
            }
        }

        self.windows.retain(|service, _| active.contains(service));
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::{CanaryConfig, TrafficPolicy};

    fn setup(delay_ms: u64) -> (Arc<TrafficManager>, CanaryProgressor) {
        let traffic = Arc::new(TrafficManager::new());
        traffic
            .set_policy(TrafficPolicy::new("users").with_canary(CanaryConfig {
                increment_delay_ms: delay_ms,
                min_success_rate: 0.9,
                ..CanaryConfig::new("v1", "v2")
            }))
            .unwrap();
        let progressor = CanaryProgressor::new(
            Arc::clone(&traffic),
            CanaryProgressionConfig {
                enabled: true,
                tick_ms: 10,
                min_samples: 10,
            },
        );
        (traffic, progressor)
    }

    fn feed(traffic: &TrafficManager, ok: u32, failed: u32) {
        for _ in 0..ok {
            traffic.record_outcome("users", "v2", true);
        }
        for _ in 0..failed {
            traffic.record_outcome("users", "v2", false);
        }
    }

    #[test]
    fn steps_when_new_version_is_healthy() {
        let (traffic, mut progressor) = setup(1_000);
        let start = Instant::now();
        assert!(progressor.evaluate(start).is_empty());

        feed(&traffic, 19, 1);
        // Delay not yet elapsed.
        assert!(progressor.evaluate(start + Duration::from_millis(500)).is_empty());

        let outcomes = progressor.evaluate(start + Duration::from_millis(1_000));
        assert_eq!(
            outcomes,
            vec![StepOutcome::Stepped { service: "users".into(), weight: 20 }]
        );
    }

    #[test]
    fn holds_when_success_rate_is_low() {
        let (traffic, mut progressor) = setup(0);
        let start = Instant::now();
        progressor.evaluate(start);

        feed(&traffic, 5, 5);
        let outcomes = progressor.evaluate(start);
        assert!(matches!(outcomes.as_slice(), [StepOutcome::Held { .. }]));
        assert_eq!(traffic.get_policy("users").unwrap().canary.as_ref().unwrap().current_weight, 10);
    }

    #[test]
    fn waits_for_enough_samples() {
        let (traffic, mut progressor) = setup(0);
        let start = Instant::now();
        progressor.evaluate(start);

        feed(&traffic, 3, 0);
        assert!(progressor.evaluate(start).is_empty());
        feed(&traffic, 7, 0);
        assert_eq!(progressor.evaluate(start).len(), 1);
    }

    #[test]
    fn never_promotes() {
        let (traffic, mut progressor) = setup(0);
        let start = Instant::now();
        progressor.evaluate(start);
        for _ in 0..20 {
            feed(&traffic, 10, 0);
            progressor.evaluate(start);
        }

        let policy = traffic.get_policy("users").unwrap();
        let canary = policy.canary.as_ref().unwrap();
        assert!(canary.enabled);
        assert_eq!(canary.current_weight, 100);
        assert_eq!(canary.stable_version, "v1");
    }
}

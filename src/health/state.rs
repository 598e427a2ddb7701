//! Instance health state machine.
//!
//! # State Transitions
//! ```text
//! Unknown/Healthy → Unhealthy: consecutive failures >= unhealthy_threshold
//! Unknown/Unhealthy → Healthy: consecutive successes >= healthy_threshold
//! ```
//!
//! Streaks reset on the opposite outcome, so a flapping instance never
//! crosses either threshold.

use std::collections::HashMap;

use crate::registry::{HealthState, InstanceKey};

#[derive(Debug, Default, Clone, Copy)]
struct Streak {
    failures: u32,
    successes: u32,
}

/// Probe streaks per instance. Owned by the monitor task alone.
#[derive(Debug)]
pub struct HealthTracker {
    healthy_threshold: u32,
    unhealthy_threshold: u32,
    streaks: HashMap<InstanceKey, Streak>,
}

impl HealthTracker {
    pub fn new(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
            streaks: HashMap::new(),
        }
    }

    /// Feed one probe result. Returns the new state if a transition is due.
    pub fn observe(&mut self, key: &InstanceKey, current: HealthState, ok: bool) -> Option<HealthState> {
        let streak = self.streaks.entry(key.clone()).or_default();
        if ok {
            streak.failures = 0;
            if current == HealthState::Healthy {
                return None;
            }
            streak.successes += 1;
            if streak.successes >= self.healthy_threshold {
                streak.successes = 0;
                return Some(HealthState::Healthy);
            }
        } else {
            streak.successes = 0;
            if current == HealthState::Unhealthy {
                return None;
            }
            streak.failures += 1;
            if streak.failures >= self.unhealthy_threshold {
                streak.failures = 0;
                return Some(HealthState::Unhealthy);
            }
        }
        None
    }

    /// Drop streaks of instances that are no longer registered.
    pub fn retain(&mut self, live: &[InstanceKey]) {
        self.streaks.retain(|k, _| live.contains(k));
    }
}

//! Traffic policy model.
//!
//! A policy carries up to three strategies. Exactly one is active at
//! evaluation time, picked in fixed precedence:
//! A/B test → canary → static split → default (no version constraint).

use serde::{Deserialize, Serialize};

/// One entry of a static weighted split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedVersion {
    pub version: String,
    pub weight: u32,
}

impl WeightedVersion {
    pub fn new(version: impl Into<String>, weight: u32) -> Self {
        Self {
            version: version.into(),
            weight,
        }
    }
}

fn enabled() -> bool {
    true
}

/// Progressive rollout from `stable_version` to `new_version`.
///
/// Weights are percentages. Only `current_weight` moves during a rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub stable_version: String,
    pub new_version: String,
    #[serde(default = "CanaryConfig::default_initial_weight")]
    pub current_weight: u32,
    #[serde(default = "CanaryConfig::default_step")]
    pub increment_step: u32,
    /// Minimum time between automatic steps, in milliseconds.
    #[serde(default = "CanaryConfig::default_delay_ms")]
    pub increment_delay_ms: u64,
    #[serde(default = "CanaryConfig::default_max_weight")]
    pub max_weight: u32,
    /// Success ratio (0.0 - 1.0) the new version must hold for automatic steps.
    #[serde(default = "CanaryConfig::default_min_success_rate")]
    pub min_success_rate: f64,
}

impl CanaryConfig {
    fn default_initial_weight() -> u32 {
        10
    }

    fn default_step() -> u32 {
        10
    }

    fn default_delay_ms() -> u64 {
        60_000
    }

    fn default_max_weight() -> u32 {
        100
    }

    fn default_min_success_rate() -> f64 {
        0.95
    }

    /// A canary starting at 10% with 10% steps up to 100%.
    pub fn new(stable_version: impl Into<String>, new_version: impl Into<String>) -> Self {
        Self {
            enabled: true,
            stable_version: stable_version.into(),
            new_version: new_version.into(),
            current_weight: Self::default_initial_weight(),
            increment_step: Self::default_step(),
            increment_delay_ms: Self::default_delay_ms(),
            max_weight: Self::default_max_weight(),
            min_success_rate: Self::default_min_success_rate(),
        }
    }

    /// True when both configs describe the same stable → new transition.
    pub fn same_rollout(&self, other: &CanaryConfig) -> bool {
        self.stable_version == other.stable_version && self.new_version == other.new_version
    }

    /// True when `self` is the promoted end state of `rollout`.
    pub fn is_promotion_of(&self, rollout: &CanaryConfig) -> bool {
        !self.enabled
            && self.stable_version == rollout.new_version
            && self.new_version == rollout.new_version
    }

    pub fn at_max(&self) -> bool {
        self.current_weight >= self.max_weight
    }
}

/// Sticky A/B assignment keyed by a request attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbTestConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub version_a: String,
    pub version_b: String,
    /// Header or cookie name whose value pins a caller to a variant.
    pub split_key: String,
    pub weight_a: u32,
    pub weight_b: u32,
}

impl AbTestConfig {
    pub fn new(
        version_a: impl Into<String>,
        version_b: impl Into<String>,
        split_key: impl Into<String>,
    ) -> Self {
        Self {
            enabled: true,
            version_a: version_a.into(),
            version_b: version_b.into(),
            split_key: split_key.into(),
            weight_a: 50,
            weight_b: 50,
        }
    }
}

/// Routing configuration for one logical service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficPolicy {
    pub service_name: String,
    #[serde(default)]
    pub splits: Vec<WeightedVersion>,
    #[serde(default)]
    pub canary: Option<CanaryConfig>,
    #[serde(default)]
    pub ab_test: Option<AbTestConfig>,
}

/// The strategy a policy evaluates with, borrowed from the policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Strategy<'a> {
    AbTest(&'a AbTestConfig),
    Canary(&'a CanaryConfig),
    Split(&'a [WeightedVersion]),
    Default,
}

/// Which strategy produced a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    AbTest,
    Canary,
    Split,
    Default,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::AbTest => "ab_test",
            StrategyKind::Canary => "canary",
            StrategyKind::Split => "split",
            StrategyKind::Default => "default",
        }
    }
}

impl Strategy<'_> {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::AbTest(_) => StrategyKind::AbTest,
            Strategy::Canary(_) => StrategyKind::Canary,
            Strategy::Split(_) => StrategyKind::Split,
            Strategy::Default => StrategyKind::Default,
        }
    }
}

impl TrafficPolicy {
    /// A policy with no strategy; evaluates to "no version constraint".
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            splits: Vec::new(),
            canary: None,
            ab_test: None,
        }
    }

    pub fn with_splits(mut self, splits: Vec<WeightedVersion>) -> Self {
        self.splits = splits;
        self
    }

    pub fn with_canary(mut self, canary: CanaryConfig) -> Self {
        self.canary = Some(canary);
        self
    }

    pub fn with_ab_test(mut self, ab_test: AbTestConfig) -> Self {
        self.ab_test = Some(ab_test);
        self
    }

    /// The canary config, if one is present and enabled.
    pub fn active_canary(&self) -> Option<&CanaryConfig> {
        self.canary.as_ref().filter(|c| c.enabled)
    }

    /// Strategy in effect, following the fixed precedence order.
    pub fn active_strategy(&self) -> Strategy<'_> {
        if let Some(ab) = self.ab_test.as_ref().filter(|ab| ab.enabled) {
            return Strategy::AbTest(ab);
        }
        if let Some(canary) = self.active_canary() {
            return Strategy::Canary(canary);
        }
        if !self.splits.is_empty() {
            return Strategy::Split(&self.splits);
        }
        Strategy::Default
    }

    /// Semantic checks applied before a policy is accepted.
    pub fn validate(&self) -> Result<(), String> {
        if self.service_name.trim().is_empty() {
            return Err("service_name must not be empty".into());
        }

        if !self.splits.is_empty() {
            if self.splits.iter().any(|s| s.version.is_empty()) {
                return Err("split versions must not be empty".into());
            }
            if self.splits.iter().map(|s| u64::from(s.weight)).sum::<u64>() == 0 {
                return Err("split weights must not all be zero".into());
            }
        }

        if let Some(canary) = &self.canary {
            if canary.stable_version.is_empty() || canary.new_version.is_empty() {
                return Err("canary versions must not be empty".into());
            }
            if canary.max_weight > 100 {
                return Err(format!("canary max_weight {} exceeds 100", canary.max_weight));
            }
            if canary.current_weight > canary.max_weight {
                return Err(format!(
                    "canary current_weight {} exceeds max_weight {}",
                    canary.current_weight, canary.max_weight
                ));
            }
            if !(0.0..=1.0).contains(&canary.min_success_rate) {
                return Err("canary min_success_rate must be within 0.0..=1.0".into());
            }
        }

        if let Some(ab) = &self.ab_test {
            if ab.version_a.is_empty() || ab.version_b.is_empty() {
                return Err("ab_test versions must not be empty".into());
            }
            if ab.split_key.trim().is_empty() {
                return Err("ab_test split_key must not be empty".into());
            }
            if u64::from(ab.weight_a) + u64::from(ab.weight_b) == 0 {
                return Err("ab_test weights must not both be zero".into());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_is_ab_then_canary_then_split() {
        let mut policy = TrafficPolicy::new("users")
            .with_splits(vec![WeightedVersion::new("v1", 1)])
            .with_canary(CanaryConfig::new("v1", "v2"))
            .with_ab_test(AbTestConfig::new("v1", "v3", "x-cohort"));
        assert_eq!(policy.active_strategy().kind(), StrategyKind::AbTest);

        policy.ab_test.as_mut().unwrap().enabled = false;
        assert_eq!(policy.active_strategy().kind(), StrategyKind::Canary);

        policy.canary.as_mut().unwrap().enabled = false;
        assert_eq!(policy.active_strategy().kind(), StrategyKind::Split);

        policy.splits.clear();
        assert_eq!(policy.active_strategy(), Strategy::Default);
    }

    #[test]
    fn rejects_canary_above_cap() {
        let policy = TrafficPolicy::new("users").with_canary(CanaryConfig {
            current_weight: 60,
            max_weight: 50,
            ..CanaryConfig::new("v1", "v2")
        });
        assert!(policy.validate().unwrap_err().contains("exceeds max_weight"));
    }

    #[test]
    fn rejects_zero_weight_split() {
        let policy = TrafficPolicy::new("users")
            .with_splits(vec![WeightedVersion::new("v1", 0), WeightedVersion::new("v2", 0)]);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn canary_defaults_from_json() {
        let policy: TrafficPolicy = serde_json::from_str(
            r#"{"service_name":"users","canary":{"stable_version":"v1","new_version":"v2"}}"#,
        )
        .unwrap();
        let canary = policy.active_canary().unwrap();
        assert_eq!(canary.current_weight, CanaryConfig::new("v1", "v2").current_weight);
        assert_eq!(canary.current_weight, 10);
        assert_eq!(canary.increment_step, 10);
        assert_eq!(canary.max_weight, 100);
    }
}

//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Ports of the sidecar must not collide
//! - Thresholds and timeouts must be positive
//! - Bootstrap policies must pass the same checks as `set_policy`
//!
//! Returns all validation errors, not just the first.

use std::collections::HashSet;
use std::fmt;

use crate::config::schema::{CircuitBreakerConfig, MeshConfig, SidecarConfig};

/// A single semantic problem in a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a whole mesh config.
pub fn validate_config(config: &MeshConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = validate_sidecar(&config.sidecar);

    let hc = &config.registry.health_check;
    if hc.enabled && hc.interval_ms == 0 {
        errors.push(ValidationError::new("registry.health_check.interval_ms", "must be > 0"));
    }
    if hc.unhealthy_threshold == 0 {
        errors.push(ValidationError::new("registry.health_check.unhealthy_threshold", "must be > 0"));
    }
    if hc.healthy_threshold == 0 {
        errors.push(ValidationError::new("registry.health_check.healthy_threshold", "must be > 0"));
    }
    if config.canary.enabled && config.canary.tick_ms == 0 {
        errors.push(ValidationError::new("canary.tick_ms", "must be > 0"));
    }

    for (i, instance) in config.instances.iter().enumerate() {
        if instance.service_name.is_empty() {
            errors.push(ValidationError::new(format!("instances[{}].service_name", i), "must not be empty"));
        }
        if instance.port == 0 {
            errors.push(ValidationError::new(format!("instances[{}].port", i), "must be > 0"));
        }
    }

    let mut seen = HashSet::new();
    for (i, policy) in config.policies.iter().enumerate() {
        if !seen.insert(policy.service_name.as_str()) {
            errors.push(ValidationError::new(
                format!("policies[{}].service_name", i),
                format!("duplicate policy for {}", policy.service_name),
            ));
        }
        if let Err(reason) = policy.validate() {
            errors.push(ValidationError::new(format!("policies[{}]", i), reason));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate the sidecar section alone; used by `SidecarProxy::new`.
pub fn validate_sidecar(config: &SidecarConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.service_name.trim().is_empty() {
        errors.push(ValidationError::new("sidecar.service_name", "must not be empty"));
    }
    if config.service_port == 0 {
        errors.push(ValidationError::new("sidecar.service_port", "must be > 0"));
    }
    if config.proxy_port != 0 && config.proxy_port == config.service_port {
        errors.push(ValidationError::new("sidecar.proxy_port", "must differ from service_port"));
    }
    if let Some(egress) = config.egress_port {
        if egress != 0 && (egress == config.service_port || egress == config.proxy_port) {
            errors.push(ValidationError::new(
                "sidecar.egress_port",
                "must differ from service_port and proxy_port",
            ));
        }
    }
    if config.request_timeout_ms == 0 {
        errors.push(ValidationError::new("sidecar.request_timeout_ms", "must be > 0"));
    }
    errors.extend(validate_breaker("sidecar.circuit_breaker", &config.circuit_breaker));

    errors
}

fn validate_breaker(prefix: &str, config: &CircuitBreakerConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if config.failure_threshold == 0 {
        errors.push(ValidationError::new(format!("{}.failure_threshold", prefix), "must be > 0"));
    }
    if config.success_threshold == 0 {
        errors.push(ValidationError::new(format!("{}.success_threshold", prefix), "must be > 0"));
    }
    if config.half_open_requests == 0 {
        errors.push(ValidationError::new(format!("{}.half_open_requests", prefix), "must be > 0"));
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::{CanaryConfig, TrafficPolicy};

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&MeshConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = MeshConfig::default();
        config.sidecar.service_port = 15001;
        config.sidecar.proxy_port = 15001;
        config.sidecar.circuit_breaker.failure_threshold = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.field == "sidecar.proxy_port"));
    }

    #[test]
    fn rejects_invalid_and_duplicate_policies() {
        let mut config = MeshConfig::default();
        let mut bad = TrafficPolicy::new("users");
        bad.canary = Some(CanaryConfig {
            current_weight: 90,
            max_weight: 50,
            ..CanaryConfig::new("v1", "v2")
        });
        config.policies.push(bad);
        config.policies.push(TrafficPolicy::new("users"));

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}

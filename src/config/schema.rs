//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a mesh node.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::registry::ServiceInstance;
use crate::traffic::TrafficPolicy;

/// Root configuration for a mesh node.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct MeshConfig {
    /// Sidecar proxy in front of the local service.
    pub sidecar: SidecarConfig,

    /// Registry and health checking.
    pub registry: RegistryConfig,

    /// Automatic canary progression.
    pub canary: CanaryProgressionConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Instances registered at startup.
    pub instances: Vec<ServiceInstance>,

    /// Traffic policies applied at startup and on reload.
    pub policies: Vec<TrafficPolicy>,
}

/// Sidecar proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Logical name of the local service.
    pub service_name: String,

    /// Host of the local application.
    pub service_host: String,

    /// Port of the local application.
    pub service_port: u16,

    /// Address the proxy listeners bind on.
    pub bind_host: String,

    /// Inbound listener port. 0 picks an ephemeral port.
    pub proxy_port: u16,

    /// Optional outbound listener for mesh calls made by the local service.
    pub egress_port: Option<u16>,

    /// Expose `/health` and `/metrics` and emit request counters.
    pub enable_metrics: bool,

    /// Emit per-request spans and HTTP trace events.
    pub enable_tracing: bool,

    /// Upper bound on a single forward, in milliseconds.
    pub request_timeout_ms: u64,

    /// Breaker settings, used for the ingress breaker and every upstream.
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            service_name: "local".to_string(),
            service_host: "127.0.0.1".to_string(),
            service_port: 8080,
            bind_host: "127.0.0.1".to_string(),
            proxy_port: 15001,
            egress_port: None,
            enable_metrics: true,
            enable_tracing: false,
            request_timeout_ms: 30_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Consecutive Half-Open successes that close it again.
    pub success_threshold: u32,

    /// Time spent Open before probes are admitted, in milliseconds.
    pub timeout_ms: u64,

    /// Concurrent probes admitted while Half-Open.
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            half_open_requests: 1,
        }
    }
}

/// How discovery picks among healthy instances.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    Random,
}

/// Registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Instance selection for `discover`.
    pub selection: SelectionStrategy,

    /// Reject re-registration of an address under a different version.
    pub strict_versions: bool,

    /// Evict instances silent for longer than this. 0 disables eviction.
    pub heartbeat_ttl_secs: u64,

    /// Active health checking.
    pub health_check: HealthCheckConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            selection: SelectionStrategy::RoundRobin,
            strict_versions: false,
            heartbeat_ttl_secs: 90,
            health_check: HealthCheckConfig::default(),
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Probe interval in milliseconds.
    pub interval_ms: u64,

    /// Probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Path to probe for HTTP instances.
    pub path: String,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            timeout_ms: 2_000,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 1,
        }
    }
}

/// Automatic canary progression.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CanaryProgressionConfig {
    /// Run the progression task.
    pub enabled: bool,

    /// How often policies are evaluated, in milliseconds.
    pub tick_ms: u64,

    /// Outcomes required on the new version before a step is considered.
    pub min_samples: u64,
}

impl Default for CanaryProgressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tick_ms: 1_000,
            min_samples: 20,
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:15000".to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let config: MeshConfig = toml::from_str(
            r#"
            [sidecar]
            service_name = "orders"
            service_port = 3000
            "#,
        )
        .unwrap();

        assert_eq!(config.sidecar.service_name, "orders");
        assert_eq!(config.sidecar.proxy_port, 15001);
        assert_eq!(config.sidecar.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.registry.selection, SelectionStrategy::RoundRobin);
        assert!(config.instances.is_empty());
    }

    #[test]
    fn parses_instances_and_policies() {
        let config: MeshConfig = toml::from_str(
            r#"
            [[instances]]
            service_name = "users"
            host = "10.0.0.5"
            port = 8080
            version = "v2"
            metadata = { region = "eu-west" }

            [[policies]]
            service_name = "users"
            splits = [ { version = "v1", weight = 80 }, { version = "v2", weight = 20 } ]
            "#,
        )
        .unwrap();

        assert_eq!(config.instances[0].version, "v2");
        assert_eq!(config.instances[0].metadata["region"], "eu-west");
        assert_eq!(config.policies[0].splits.len(), 2);
    }
}

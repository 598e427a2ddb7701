//! Service instance records.
//!
//! Records are immutable once published into the registry. Health changes
//! and heartbeats build a new record and swap it in whole, so a reader never
//! sees a half-updated instance.

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Wire protocol spoken by an instance; selects the liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Grpc,
}

/// Health as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_gauge(self) -> f64 {
        match self {
            HealthState::Healthy => 1.0,
            HealthState::Unknown | HealthState::Unhealthy => 0.0,
        }
    }
}

/// Registry identity of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

impl InstanceKey {
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.service_name, self.host, self.port)
    }
}

fn now() -> SystemTime {
    SystemTime::now()
}

/// One running copy of a logical service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    /// Free-form version tag, e.g. "v1". Empty means untagged.
    #[serde(default)]
    pub version: String,
    /// Region, weight hints and other labels, ordered by key.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub health: HealthState,
    #[serde(default = "now")]
    pub registered_at: SystemTime,
    #[serde(default = "now")]
    pub last_heartbeat: SystemTime,
}

impl ServiceInstance {
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let at = SystemTime::now();
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
            protocol: Protocol::Http,
            version: String::new(),
            metadata: BTreeMap::new(),
            health: HealthState::Unknown,
            registered_at: at,
            last_heartbeat: at,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.service_name.clone(), self.host.clone(), self.port)
    }

    /// `host:port` authority used when forwarding.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HealthState::Healthy
    }

    /// True when `version` is unconstrained or equal to this instance's tag.
    pub fn matches_version(&self, version: Option<&str>) -> bool {
        match version {
            None | Some("") => true,
            Some(v) => self.version == v,
        }
    }

    pub(crate) fn with_health(&self, health: HealthState) -> Self {
        Self {
            health,
            ..self.clone()
        }
    }

    pub(crate) fn with_heartbeat(&self, at: SystemTime) -> Self {
        Self {
            last_heartbeat: at,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_authority_is_bracketed() {
        let v4 = ServiceInstance::new("users", "10.0.0.1", 8080);
        let v6 = ServiceInstance::new("users", "::1", 8080);
        assert_eq!(v4.authority(), "10.0.0.1:8080");
        assert_eq!(v6.authority(), "[::1]:8080");
    }

    #[test]
    fn empty_version_constraint_matches_everything() {
        let inst = ServiceInstance::new("users", "10.0.0.1", 8080).with_version("v2");
        assert!(inst.matches_version(None));
        assert!(inst.matches_version(Some("")));
        assert!(inst.matches_version(Some("v2")));
        assert!(!inst.matches_version(Some("v1")));
    }

    #[test]
    fn registration_json_defaults() {
        let inst: ServiceInstance =
            serde_json::from_str(r#"{"service_name":"users","host":"10.0.0.1","port":80}"#).unwrap();
        assert_eq!(inst.health, HealthState::Unknown);
        assert_eq!(inst.protocol, Protocol::Http);
        assert!(inst.version.is_empty());
    }
}

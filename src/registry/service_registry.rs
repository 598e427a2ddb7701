//! In-memory service registry.
//!
//! # Responsibilities
//! - Upsert and remove instances keyed by (service, host, port)
//! - Answer discovery from the healthy subset of a service
//! - Apply health transitions and heartbeats by whole-record replacement
//! - Evict instances whose heartbeat is older than the TTL
//! - Own the background health monitor's lifecycle

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::config::RegistryConfig;
use crate::error::{MeshError, Result};
use crate::health::monitor::HealthMonitor;
use crate::lifecycle::Shutdown;
use crate::load_balancer::{self, LoadBalancer};
use crate::observability::metrics;
use crate::registry::instance::{HealthState, InstanceKey, ServiceInstance};

/// Instances of one logical service and the balancer rotating over them.
#[derive(Debug)]
struct ServiceEntry {
    instances: Vec<Arc<ServiceInstance>>,
    balancer: Box<dyn LoadBalancer>,
}

impl ServiceEntry {
    fn position(&self, host: &str, port: u16) -> Option<usize> {
        self.instances
            .iter()
            .position(|i| i.host == host && i.port == port)
    }
}

/// Process-local directory of service instances.
#[derive(Debug)]
pub struct ServiceRegistry {
    config: RegistryConfig,
    services: DashMap<String, ServiceEntry>,
    health_task: Mutex<Option<(Shutdown, JoinHandle<()>)>>,
}

impl ServiceRegistry {
    /// Create a registry without a background health monitor.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            services: DashMap::new(),
            health_task: Mutex::new(None),
        }
    }

    /// Create a registry and start its health monitor.
    ///
    /// The monitor runs until [`ServiceRegistry::shutdown`] is called.
    /// Must be called from within a Tokio runtime.
    pub fn start(config: RegistryConfig) -> Arc<Self> {
        let registry = Arc::new(Self::new(config));
        let monitor_needed =
            registry.config.health_check.enabled || registry.config.heartbeat_ttl_secs > 0;

        if monitor_needed {
            let shutdown = Shutdown::new();
            let monitor = HealthMonitor::new(Arc::downgrade(&registry), registry.config.clone());
            let handle = tokio::spawn(monitor.run(shutdown.subscribe()));
            if let Ok(mut slot) = registry.health_task.lock() {
                *slot = Some((shutdown, handle));
            }
        }
        registry
    }

    /// Stop the health monitor and wait for it to exit.
    pub async fn shutdown(&self) {
        let task = self.health_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some((shutdown, handle)) = task {
            shutdown.trigger();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Health monitor task ended abnormally");
            }
            tracing::info!("Registry health monitor stopped");
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Insert or replace an instance. Health starts as Unknown.
    pub fn register(&self, instance: ServiceInstance) -> Result<()> {
        let now = SystemTime::now();
        let record = Arc::new(ServiceInstance {
            health: HealthState::Unknown,
            registered_at: now,
            last_heartbeat: now,
            ..instance
        });

        let mut entry = self
            .services
            .entry(record.service_name.clone())
            .or_insert_with(|| ServiceEntry {
                instances: Vec::new(),
                balancer: load_balancer::for_strategy(self.config.selection),
            });

        match entry.position(&record.host, record.port) {
            Some(idx) => {
                let existing = &entry.instances[idx];
                if self.config.strict_versions && existing.version != record.version {
                    return Err(MeshError::DuplicateInstance {
                        service: record.service_name.clone(),
                        host: record.host.clone(),
                        port: record.port,
                        existing: existing.version.clone(),
                    });
                }
                entry.instances[idx] = Arc::clone(&record);
            }
            None => entry.instances.push(Arc::clone(&record)),
        }
        let count = entry.instances.len();
        drop(entry);

        tracing::info!(
            instance = %record.key(),
            version = %record.version,
            protocol = ?record.protocol,
            "Instance registered"
        );
        metrics::record_registry_instances(&record.service_name, count);
        metrics::record_instance_health(&record.service_name, &record.authority(), HealthState::Unknown);
        Ok(())
    }

    /// Remove an instance. Absent instances are ignored.
    ///
    /// The service name stays known, so later discovery reports
    /// `NoHealthyInstance` rather than `ServiceNotFound`.
    pub fn deregister(&self, service_name: &str, host: &str, port: u16) {
        let Some(mut entry) = self.services.get_mut(service_name) else {
            return;
        };
        if let Some(idx) = entry.position(host, port) {
            entry.instances.remove(idx);
            let count = entry.instances.len();
            drop(entry);
            tracing::info!(instance = %InstanceKey::new(service_name, host, port), "Instance deregistered");
            metrics::record_registry_instances(service_name, count);
        }
    }

    /// Pick one healthy instance of a service.
    pub fn discover(&self, service_name: &str) -> Result<Arc<ServiceInstance>> {
        self.discover_version(service_name, None)
    }

    /// Pick one healthy instance of a service, optionally of one version.
    pub fn discover_version(
        &self,
        service_name: &str,
        version: Option<&str>,
    ) -> Result<Arc<ServiceInstance>> {
        let entry = self
            .services
            .get(service_name)
            .ok_or_else(|| MeshError::ServiceNotFound(service_name.to_string()))?;

        let eligible: Vec<Arc<ServiceInstance>> = entry
            .instances
            .iter()
            .filter(|i| i.is_healthy() && i.matches_version(version))
            .cloned()
            .collect();

        entry.balancer.next_instance(&eligible).ok_or_else(|| {
            tracing::debug!(
                service = %service_name,
                version = ?version,
                registered = entry.instances.len(),
                "No healthy instance eligible"
            );
            MeshError::NoHealthyInstance(service_name.to_string())
        })
    }

    /// Names of every known service, sorted.
    pub fn list_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshot of a service's instances. Unknown names yield an empty list.
    pub fn get_service_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.services
            .get(service_name)
            .map(|e| e.instances.iter().map(|i| (**i).clone()).collect())
            .unwrap_or_default()
    }

    /// Snapshot of every instance; used by the health monitor.
    pub fn all_instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.services
            .iter()
            .flat_map(|e| e.instances.clone())
            .collect()
    }

    /// Replace an instance's record with one carrying `health`.
    pub fn report_health(
        &self,
        service_name: &str,
        host: &str,
        port: u16,
        health: HealthState,
    ) -> Result<()> {
        let changed = self.replace(service_name, host, port, |i| {
            (i.health != health).then(|| i.with_health(health))
        })?;
        if changed {
            tracing::info!(
                instance = %InstanceKey::new(service_name, host, port),
                health = ?health,
                "Instance health changed"
            );
            metrics::record_instance_health(service_name, &format!("{}:{}", host, port), health);
        }
        Ok(())
    }

    /// Refresh an instance's heartbeat timestamp.
    pub fn heartbeat(&self, service_name: &str, host: &str, port: u16) -> Result<()> {
        let now = SystemTime::now();
        self.replace(service_name, host, port, |i| Some(i.with_heartbeat(now)))
            .map(|_| ())
    }

    /// Remove every instance whose last heartbeat is older than `ttl`.
    pub fn evict_stale(&self, ttl: Duration) -> Vec<InstanceKey> {
        let now = SystemTime::now();
        let is_stale = |i: &ServiceInstance| {
            now.duration_since(i.last_heartbeat)
                .map(|silent| silent > ttl)
                .unwrap_or(false)
        };

        let mut evicted = Vec::new();
        for mut entry in self.services.iter_mut() {
            let before = entry.instances.len();
            entry.instances.retain(|i| {
                if is_stale(&**i) {
                    evicted.push(i.key());
                    false
                } else {
                    true
                }
            });
            if entry.instances.len() != before {
                metrics::record_registry_instances(entry.key(), entry.instances.len());
            }
        }
        for key in &evicted {
            tracing::warn!(instance = %key, ttl_secs = ttl.as_secs(), "Evicted instance with expired heartbeat");
        }
        evicted
    }

    /// Swap in the record produced by `update`. Returns whether it changed.
    fn replace<F>(&self, service_name: &str, host: &str, port: u16, update: F) -> Result<bool>
    where
        F: FnOnce(&ServiceInstance) -> Option<ServiceInstance>,
    {
        let mut entry = self
            .services
            .get_mut(service_name)
            .ok_or_else(|| MeshError::ServiceNotFound(service_name.to_string()))?;
        let idx = entry
            .position(host, port)
            .ok_or_else(|| MeshError::ServiceNotFound(InstanceKey::new(service_name, host, port).to_string()))?;

        match update(&*entry.instances[idx]) {
            Some(next) => {
                entry.instances[idx] = Arc::new(next);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

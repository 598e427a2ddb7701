//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every registered instance
//! - HTTP instances: GET the configured path, 2xx is healthy
//! - gRPC instances: a TCP connect within the timeout is healthy
//! - Apply hysteresis and push transitions into the registry
//! - Evict instances whose heartbeat expired

use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::RegistryConfig;
use crate::health::state::HealthTracker;
use crate::registry::{Protocol, ServiceInstance, ServiceRegistry};

pub struct HealthMonitor {
    registry: Weak<ServiceRegistry>,
    config: RegistryConfig,
    client: Client<HttpConnector, Body>,
    tracker: HealthTracker,
}

impl HealthMonitor {
    pub fn new(registry: Weak<ServiceRegistry>, config: RegistryConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let tracker = HealthTracker::new(
            config.health_check.healthy_threshold,
            config.health_check.unhealthy_threshold,
        );

        Self {
            registry,
            config,
            client,
            tracker,
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            enabled = self.config.health_check.enabled,
            interval_ms = self.config.health_check.interval_ms,
            path = %self.config.health_check.path,
            heartbeat_ttl_secs = self.config.heartbeat_ttl_secs,
            "Health monitor starting"
        );

        let interval = Duration::from_millis(self.config.health_check.interval_ms.max(1));
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(registry) = self.registry.upgrade() else {
                        tracing::debug!("Registry dropped, health monitor exiting");
                        break;
                    };
                    self.tick(&registry).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    async fn tick(&mut self, registry: &Arc<ServiceRegistry>) {
        if self.config.heartbeat_ttl_secs > 0 {
            registry.evict_stale(Duration::from_secs(self.config.heartbeat_ttl_secs));
        }
        if self.config.health_check.enabled {
            self.check_all(registry).await;
        }
    }

    async fn check_all(&mut self, registry: &Arc<ServiceRegistry>) {
        let instances = registry.all_instances();
        let live: Vec<_> = instances.iter().map(|i| i.key()).collect();
        self.tracker.retain(&live);

        let this = &*self;
        let probes = instances.iter().map(|instance| {
            let instance = Arc::clone(instance);
            async move {
                let ok = this.probe(&instance).await;
                (instance, ok)
            }
        });
        let results = futures_util::future::join_all(probes).await;

        for (instance, ok) in results {
            let key = instance.key();
            if ok {
                // A passing probe counts as a heartbeat.
                let _ = registry.heartbeat(&key.service_name, &key.host, key.port);
            }
            if let Some(next) = self.tracker.observe(&key, instance.health, ok) {
                if let Err(e) = registry.report_health(&key.service_name, &key.host, key.port, next) {
                    tracing::debug!(instance = %key, error = %e, "Instance vanished before health update");
                }
            }
        }
    }

    async fn probe(&self, instance: &ServiceInstance) -> bool {
        let timeout = Duration::from_millis(self.config.health_check.timeout_ms);
        match instance.protocol {
            Protocol::Http => self.probe_http(instance, timeout).await,
            Protocol::Grpc => probe_tcp(instance, timeout).await,
        }
    }

    async fn probe_http(&self, instance: &ServiceInstance, timeout: Duration) -> bool {
        let uri = format!("http://{}{}", instance.authority(), self.config.health_check.path);
        let request = match Request::builder()
            .method("GET")
            .uri(uri)
            .header("user-agent", "service-mesh-health-check")
            .body(Body::empty())
        {
            Ok(req) => req,
            Err(e) => {
                tracing::error!("Failed to build health check request: {}", e);
                return false;
            }
        };

        match time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let success = response.status().is_success();
                if !success {
                    tracing::warn!(instance = %instance.key(), status = %response.status(), "Health check failed: non-success status");
                }
                success
            }
            Ok(Err(e)) => {
                tracing::warn!(instance = %instance.key(), error = %e, "Health check failed: connection error");
                false
            }
            Err(_) => {
                tracing::warn!(instance = %instance.key(), "Health check failed: timeout");
                false
            }
        }
    }
}

async fn probe_tcp(instance: &ServiceInstance, timeout: Duration) -> bool {
    match time::timeout(timeout, TcpStream::connect(instance.authority())).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::warn!(instance = %instance.key(), error = %e, "Liveness check failed: connect error");
            false
        }
        Err(_) => {
            tracing::warn!(instance = %instance.key(), "Liveness check failed: timeout");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthCheckConfig;
    use crate::registry::HealthState;
    use tokio::net::TcpListener;

    fn fast_config() -> RegistryConfig {
        RegistryConfig {
            heartbeat_ttl_secs: 0,
            health_check: HealthCheckConfig {
                enabled: true,
                interval_ms: 20,
                timeout_ms: 200,
                unhealthy_threshold: 1,
                healthy_threshold: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn grpc_instance_becomes_healthy_when_port_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let registry = ServiceRegistry::start(fast_config());
        registry
            .register(ServiceInstance::new("ledger", "127.0.0.1", port).with_protocol(Protocol::Grpc))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(registry.get_service_instances("ledger")[0].health, HealthState::Healthy);
        assert!(registry.discover("ledger").is_ok());

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_instance_is_marked_unhealthy() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let registry = ServiceRegistry::start(fast_config());
        registry
            .register(ServiceInstance::new("ledger", "127.0.0.1", port))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(registry.get_service_instances("ledger")[0].health, HealthState::Unhealthy);

        registry.shutdown().await;
    }
}

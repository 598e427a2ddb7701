//! Egress routing: traffic policy, discovery and per-upstream breakers.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HOST;
use service_mesh::http::X_MESH_REASON;
use service_mesh::registry::HealthState;
use service_mesh::resilience::BreakerState;
use service_mesh::traffic::{AbTestConfig, WeightedVersion};
use service_mesh::{
    BreakerRegistry, MeshClient, MeshError, ServiceInstance, ServiceRegistry, SidecarProxy,
    TrafficManager, TrafficPolicy,
};

mod common;

async fn register_healthy(registry: &ServiceRegistry, service: &str, version: &str, port: u16) {
    registry
        .register(ServiceInstance::new(service, "127.0.0.1", port).with_version(version))
        .unwrap();
    registry
        .report_health(service, "127.0.0.1", port, HealthState::Healthy)
        .unwrap();
}

async fn body(response: axum::http::Response<axum::body::Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn split_policy_pins_the_version() {
    let v1 = common::start_mock_backend("v1").await;
    let v2 = common::start_mock_backend("v2").await;

    let registry = Arc::new(ServiceRegistry::new(common::quiet_registry()));
    register_healthy(&registry, "users", "v1", v1.port()).await;
    register_healthy(&registry, "users", "v2", v2.port()).await;

    let traffic = Arc::new(TrafficManager::new());
    traffic
        .set_policy(TrafficPolicy::new("users").with_splits(vec![
            WeightedVersion::new("v1", 0),
            WeightedVersion::new("v2", 100),
        ]))
        .unwrap();

    let client = MeshClient::new(
        registry,
        traffic.clone(),
        Arc::new(BreakerRegistry::new(Default::default())),
        Duration::from_secs(5),
    );
    for _ in 0..5 {
        let response = client.get("users", "/profile").await.unwrap();
        assert_eq!(body(response).await, "v2");
    }
    assert_eq!(v1.calls(), 0);
    assert_eq!(v2.calls(), 5);
    assert_eq!(traffic.version_stats("users", "v2").successes, 5);
}

#[tokio::test]
async fn upstream_breakers_are_independent_per_version() {
    let v1 = common::start_mock_backend("v1").await;
    let v2 = common::start_programmable_backend(|_| async { (500, "broken".into()) }).await;

    let registry = Arc::new(ServiceRegistry::new(common::quiet_registry()));
    register_healthy(&registry, "users", "v1", v1.port()).await;
    register_healthy(&registry, "users", "v2", v2.port()).await;

    let traffic = Arc::new(TrafficManager::new());
    traffic
        .set_policy(TrafficPolicy::new("users").with_splits(vec![WeightedVersion::new("v2", 1)]))
        .unwrap();

    let mut config = common::sidecar_config("frontend", common::closed_port().await);
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.timeout_ms = 60_000;
    let proxy = SidecarProxy::new(config, registry, traffic.clone()).unwrap();
    let client = proxy.client();

    for _ in 0..2 {
        let response = client.get("users", "/").await.unwrap();
        assert_eq!(response.status(), 500);
    }
    let err = client.get("users", "/").await.unwrap_err();
    assert!(matches!(err, MeshError::BreakerOpen(ref target) if target == "users@v2"));
    assert_eq!(v2.calls(), 2);
    assert_eq!(traffic.version_stats("users", "v2").failures, 2);

    traffic
        .set_policy(TrafficPolicy::new("users").with_splits(vec![WeightedVersion::new("v1", 1)]))
        .unwrap();
    let response = client.get("users", "/").await.unwrap();
    assert_eq!(body(response).await, "v1");

    let breakers = proxy.upstream_breakers();
    assert_eq!(breakers.get("users", Some("v2")).unwrap().state(), BreakerState::Open);
    assert_eq!(breakers.get("users", Some("v1")).unwrap().state(), BreakerState::Closed);
    assert_eq!(proxy.ingress_breaker().state(), BreakerState::Closed);
}

#[tokio::test]
async fn discovery_failures_are_distinguishable() {
    let registry = Arc::new(ServiceRegistry::new(common::quiet_registry()));
    registry
        .register(ServiceInstance::new("payments", "127.0.0.1", 9).with_version("v1"))
        .unwrap();

    let client = MeshClient::new(
        registry,
        Arc::new(TrafficManager::new()),
        Arc::new(BreakerRegistry::new(Default::default())),
        Duration::from_secs(1),
    );

    // Registered but never probed healthy.
    let err = client.get("payments", "/").await.unwrap_err();
    assert!(matches!(err, MeshError::NoHealthyInstance(_)));

    let err = client.get("ghost", "/").await.unwrap_err();
    assert!(matches!(err, MeshError::ServiceNotFound(_)));
}

#[tokio::test]
async fn egress_listener_routes_by_host_header() {
    let a = common::start_mock_backend("variant-a").await;
    let b = common::start_mock_backend("variant-b").await;

    let registry = Arc::new(ServiceRegistry::new(common::quiet_registry()));
    register_healthy(&registry, "checkout", "a", a.port()).await;
    register_healthy(&registry, "checkout", "b", b.port()).await;

    let traffic = Arc::new(TrafficManager::new());
    traffic
        .set_policy(
            TrafficPolicy::new("checkout").with_ab_test(AbTestConfig::new("a", "b", "x-user-cohort")),
        )
        .unwrap();

    let local = common::start_mock_backend("local").await;
    let mut config = common::sidecar_config("cart", local.port());
    config.egress_port = Some(0);
    let proxy = SidecarProxy::new(config, registry, traffic).unwrap();
    proxy.start().await.unwrap();
    let egress = proxy.egress_addr().unwrap();
    let client = common::client();

    let mut first = None;
    for _ in 0..5 {
        let res = client
            .get(format!("http://{}/pay", egress))
            .header(HOST, "checkout:8080")
            .header("x-user-cohort", "gold")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        let text = res.text().await.unwrap();
        match &first {
            None => first = Some(text),
            Some(seen) => assert_eq!(seen, &text, "a cohort must stick to one variant"),
        }
    }
    assert_eq!(a.calls() + b.calls(), 5);
    assert_eq!(local.calls(), 0);

    let res = client
        .get(format!("http://{}/", egress))
        .header(HOST, "nowhere")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
    assert_eq!(res.headers()[X_MESH_REASON], "service-not-found");

    proxy.stop(Duration::from_secs(5)).await.unwrap();
}

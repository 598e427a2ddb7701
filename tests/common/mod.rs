//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use service_mesh::config::{RegistryConfig, SidecarConfig};

/// A mock upstream with a call counter and the last request head it saw.
#[derive(Clone)]
pub struct MockBackend {
    pub addr: SocketAddr,
    calls: Arc<AtomicU32>,
    last_request: Arc<Mutex<String>>,
}

impl MockBackend {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> String {
        self.last_request.lock().unwrap().clone()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// Start a mock backend that always answers 200 with `body`.
pub async fn start_mock_backend(body: &'static str) -> MockBackend {
    start_programmable_backend(move |_| async move { (200, body.to_string()) }).await
}

/// Start a backend whose response is computed per call.
///
/// The closure receives the zero-based call number.
pub async fn start_programmable_backend<F, Fut>(f: F) -> MockBackend
where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = MockBackend {
        addr: listener.local_addr().unwrap(),
        calls: Arc::new(AtomicU32::new(0)),
        last_request: Arc::new(Mutex::new(String::new())),
    };
    let f = Arc::new(f);
    let state = backend.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let f = f.clone();
            let state = state.clone();
            tokio::spawn(async move {
                serve_connection(socket, state, f).await;
            });
        }
    });

    backend
}

async fn serve_connection<F, Fut>(mut socket: TcpStream, state: MockBackend, f: Arc<F>)
where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let Some(head) = read_request_head(&mut socket).await else {
        return;
    };
    *state.last_request.lock().unwrap() = head;
    let call = state.calls.fetch_add(1, Ordering::SeqCst);

    let (status, body) = f(call).await;
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn read_request_head(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            return Some(String::from_utf8_lossy(&buf).to_string());
        }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Sidecar config in front of `service_port` on an ephemeral proxy port.
pub fn sidecar_config(service_name: &str, service_port: u16) -> SidecarConfig {
    SidecarConfig {
        service_name: service_name.to_string(),
        service_port,
        proxy_port: 0,
        request_timeout_ms: 5_000,
        ..SidecarConfig::default()
    }
}

/// Registry config without background probing or eviction.
pub fn quiet_registry() -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.health_check.enabled = false;
    config.heartbeat_ttl_secs = 0;
    config
}

/// HTTP client that never pools or proxies.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

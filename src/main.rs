//! Service mesh node.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────┐
//!                    │                   SIDECAR                         │
//!   inbound  ───────▶│ ingress breaker ──▶ forward ──▶ local application │
//!                    │                                                   │
//!   outbound ───────▶│ traffic policy ──▶ registry ──▶ upstream breaker  │──▶ mesh service
//!                    │                                  ──▶ forward      │
//!                    └──────────────────────────────────────────────────┘
//!                      ▲ admin API        ▲ health monitor   ▲ canary progressor
//! ```
//!
//! Everything is in memory. On start the node registers the `[[instances]]`
//! and applies the `[[policies]]` from its config file; policies are
//! re-applied whenever the file changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use service_mesh::admin::{self, AdminState};
use service_mesh::config::{load_config, watcher::apply_policies, watcher::ConfigWatcher};
use service_mesh::lifecycle::{wait_for_signal, Shutdown};
use service_mesh::observability::logging::init_logging;
use service_mesh::traffic::CanaryProgressor;
use service_mesh::{ServiceRegistry, SidecarProxy, TrafficManager};

#[derive(Parser)]
#[command(name = "service-mesh", version)]
#[command(about = "Sidecar proxy with service registry and traffic management", long_about = None)]
struct Args {
    /// Path to the mesh configuration file
    #[arg(short, long, default_value = "mesh.toml")]
    config: PathBuf,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, default_value_t = 30)]
    drain_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;
    init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        service = %config.sidecar.service_name,
        "service-mesh starting"
    );

    let registry = ServiceRegistry::start(config.registry.clone());
    for instance in config.instances.iter().cloned() {
        let key = instance.key();
        if let Err(e) = registry.register(instance) {
            tracing::warn!(instance = %key, error = %e, "Bootstrap registration failed");
        }
    }

    let traffic = Arc::new(TrafficManager::new());
    let applied = apply_policies(&traffic, &config);
    tracing::info!(
        instances = config.instances.len(),
        policies = applied,
        "Bootstrap state loaded"
    );

    let sidecar = SidecarProxy::new(config.sidecar.clone(), registry.clone(), traffic.clone())?;
    sidecar.start().await?;

    let shutdown = Shutdown::new();
    let mut tasks = Vec::new();

    if config.canary.enabled {
        let progressor = CanaryProgressor::new(traffic.clone(), config.canary.clone());
        tasks.push(progressor.spawn(shutdown.subscribe()));
    }

    if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = AdminState {
            registry: registry.clone(),
            traffic: traffic.clone(),
            breakers: sidecar.upstream_breakers().clone(),
            ingress: Some(sidecar.ingress_breaker().clone()),
            api_key: config.admin.api_key.as_str().into(),
        };
        let signal = shutdown.signalled();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(listener, state, signal).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        }));
    }

    let (watcher, mut updates) = ConfigWatcher::new(&args.config);
    let _watcher = match watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Config hot reload disabled");
            None
        }
    };
    let reload_traffic = traffic.clone();
    let mut reload_shutdown = shutdown.subscribe();
    tasks.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reload_shutdown.recv() => break,
                update = updates.recv() => match update {
                    Some(new_config) => {
                        let applied = apply_policies(&reload_traffic, &new_config);
                        tracing::info!(policies = applied, "Traffic policies reloaded");
                    }
                    None => break,
                },
            }
        }
    }));

    wait_for_signal().await;
    tracing::info!("Shutting down");

    shutdown.trigger();
    if let Err(e) = sidecar.stop(Duration::from_secs(args.drain_secs)).await {
        tracing::warn!(error = %e, "Sidecar did not drain cleanly");
    }
    for task in tasks {
        let _ = task.await;
    }
    registry.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

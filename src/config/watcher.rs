//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::MeshConfig;
use crate::traffic::TrafficManager;

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<MeshConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for validated configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<MeshConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        tracing::info!("Config file change detected, reloading...");
                        match load_config(&path) {
                            Ok(new_config) => {
                                let _ = tx.send(new_config);
                            }
                            Err(e) => {
                                tracing::error!(
                                    "Failed to reload config: {}. Keeping current policies.",
                                    e
                                );
                            }
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Apply the policies of a reloaded config.
///
/// Policies present in the file replace the live ones. Canary progress made
/// since the file was last written is kept when the file still describes the
/// same rollout, and a promoted rollout stays promoted. Returns the number of
/// policies applied.
pub fn apply_policies(traffic: &TrafficManager, config: &MeshConfig) -> usize {
    let mut applied = 0;
    for policy in &config.policies {
        let mut policy = policy.clone();
        if let (Ok(live), Some(canary)) = (traffic.get_policy(&policy.service_name), policy.canary.as_mut()) {
            if let Some(live_canary) = live.canary.as_ref() {
                if live_canary.is_promotion_of(canary) {
                    tracing::info!(
                        service = %policy.service_name,
                        version = %live_canary.new_version,
                        "Keeping promoted canary over reloaded rollout"
                    );
                    *canary = live_canary.clone();
                } else if live_canary.same_rollout(canary) && live_canary.current_weight > canary.current_weight {
                    canary.current_weight = live_canary.current_weight.min(canary.max_weight);
                }
            }
        }
        match traffic.set_policy(policy) {
            Ok(()) => applied += 1,
            Err(e) => tracing::error!(error = %e, "Rejected policy from config reload"),
        }
    }
    applied
}

//! Periodic background tasks: the agent heartbeat and the garbage collector loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent_reference::AgentReference;
use crate::backend::Backend;
use crate::garbage_collector::GarbageCollector;

/// A spawned periodic task, stopped through its shutdown channel.
pub struct BackgroundTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Signal the task and wait for its current iteration to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.await.ok();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Bumps the agent heartbeat counter every `interval` until stopped.
pub fn spawn_heartbeat(agent_ref: Arc<AgentReference>, backend: Arc<dyn Backend>, interval: Duration) -> BackgroundTask {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match agent_ref.bump_heartbeat(backend.as_ref()).await {
                        Ok(()) => debug!(agent = %agent_ref.address(), "heartbeat"),
                        Err(e) => warn!(agent = %agent_ref.address(), error = %e, "failed to bump heartbeat"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }
        info!(agent = %agent_ref.address(), "heartbeat stopped");
    });
    BackgroundTask { shutdown_tx, handle }
}

/// Runs a garbage collection pass every `interval` until stopped.
pub fn spawn_garbage_collector(mut collector: GarbageCollector, interval: Duration) -> BackgroundTask {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match collector.run_once().await {
                        Ok(collected) if !collected.is_empty() => {
                            info!(agents = ?collected, "garbage collected dead agents");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "garbage collection pass failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }
        info!("garbage collector stopped");
    });
    BackgroundTask { shutdown_tx, handle }
}

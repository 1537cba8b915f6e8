//! Lifecycle - background housekeeping and shutdown coordination
//!
//! Handles:
//! - Periodic routing-table sweep
//! - Two-phase shutdown of registered components

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rp_routing::RoutingTable;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Runs the routing-table sweep until shut down.
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    pub fn start(routing_table: Arc<dyn RoutingTable>, cleanup_interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Routing table sweep
        {
            let mut shutdown_rx = shutdown_tx.subscribe();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cleanup_interval);
                // the first tick completes immediately
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let purged = routing_table.purge();
                            debug!(purged = purged.len(), remaining = routing_table.len(), "Routing table sweep");
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Routing table sweep shutting down");
                            break;
                        }
                    }
                }
            });
        }

        info!(interval_ms = cleanup_interval.as_millis() as u64, "Lifecycle manager started");

        Self { shutdown_tx }
    }

    /// Signal shutdown to all lifecycle tasks
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Component that takes part in coordinated shutdown.
#[async_trait]
pub trait ShutdownListener: Send + Sync {
    /// Stop taking new work and finish what can be finished.
    async fn prepare_for_shutdown(&self);

    /// Release everything; called after every listener has prepared.
    async fn shutdown(&self);
}

/// Shuts registered listeners down in two phases: every listener prepares,
/// then every listener shuts down.
#[derive(Default)]
pub struct ShutdownNotifier {
    listeners: Mutex<Vec<Arc<dyn ShutdownListener>>>,
}

impl ShutdownNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ShutdownListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn unregister(&self, listener: &Arc<dyn ShutdownListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub async fn shutdown(&self) {
        let listeners = self.listeners.lock().clone();
        info!(listeners = listeners.len(), "Shutting down");

        futures::future::join_all(listeners.iter().map(|l| l.prepare_for_shutdown())).await;
        for listener in &listeners {
            listener.shutdown().await;
        }

        info!("Shutdown complete");
    }
}

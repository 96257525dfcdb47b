//! Controller lifecycle.
//!
//! [`ControllerManager`] wires the reconcilers to a store and runs each
//! controller as a background task until shutdown.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut manager = ControllerManager::new(store, telemetry, config);
//! manager.start();
//! // ... serve ...
//! manager.shutdown().await;
//! ```

use crate::claim::ClaimReconciler;
use crate::config::ControllerConfig;
use crate::pool::{PoolStats, WarmPoolReconciler};
use crate::runtime::{Controller, Reconciler};
use crate::sandbox::SandboxReconciler;
use crate::telemetry::Telemetry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warren_api::ObjectStore;

/// Runs the sandbox controller and, when extensions are enabled, the warm
/// pool and claim controllers.
pub struct ControllerManager {
    store: Arc<dyn ObjectStore>,
    telemetry: Arc<Telemetry>,
    config: ControllerConfig,
    stats: Arc<PoolStats>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ControllerManager {
    pub fn new(store: Arc<dyn ObjectStore>, telemetry: Arc<Telemetry>, config: ControllerConfig) -> Self {
        Self {
            store,
            telemetry,
            config,
            stats: Arc::new(PoolStats::default()),
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Spawn the controllers. Must be called within a Tokio runtime.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            tracing::warn!("Controllers already started");
            return;
        }

        self.spawn(SandboxReconciler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.telemetry),
            self.config.clone(),
        ));

        if self.config.extensions {
            self.spawn(WarmPoolReconciler::new(
                Arc::clone(&self.store),
                Arc::clone(&self.stats),
            ));
            self.spawn(ClaimReconciler::new(
                Arc::clone(&self.store),
                Arc::clone(&self.telemetry),
                Arc::clone(&self.stats),
                self.config.clone(),
            ));
        }

        tracing::info!(
            controllers = self.handles.len(),
            extensions = self.config.extensions,
            workers = self.config.workers,
            "Controller manager started"
        );
    }

    fn spawn<R: Reconciler>(&mut self, reconciler: R) {
        let controller = Controller::new(Arc::new(reconciler), Arc::clone(&self.store), &self.config);
        let shutdown = self.shutdown.child_token();
        self.handles
            .push(tokio::spawn(async move { controller.run(shutdown).await }));
    }

    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }

    /// Check if the controllers are running.
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty() && !self.shutdown.is_cancelled()
    }

    /// Stop every controller and wait for in-flight reconciles to finish.
    pub async fn shutdown(&mut self) {
        tracing::info!("Shutting down controllers");
        self.shutdown.cancel();

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = ?e, "Controller task panicked during shutdown");
            }
        }

        tracing::info!(
            warm_hits = self.stats.warm_hits(),
            cold_misses = self.stats.cold_misses(),
            hit_rate = format!("{:.1}%", self.stats.hit_rate()),
            pool_pods_created = self.stats.created(),
            pool_pods_deleted = self.stats.deleted(),
            "Controllers shut down"
        );
    }
}

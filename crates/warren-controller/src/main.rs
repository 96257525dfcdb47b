//! Warren controller entry point.
//!
//! Starts the sandbox controllers over an in-memory object store and serves
//! the resources over HTTP until interrupted.

use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warren_api::{MemoryStore, ObjectStore, Registry};
use warren_controller::{http, telemetry, AppState, WarrenConfig};
use warren_core::ControllerManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("warren_controller=info".parse()?)
                .add_directive("warren_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Warren controller");

    let config = WarrenConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate()?;

    let registry = if config.extensions {
        Registry::core().with_extensions()
    } else {
        Registry::core()
    };
    let registry = Arc::new(registry);
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new(Arc::clone(&registry)));

    let guard = telemetry::init(&config)?;

    let mut manager =
        ControllerManager::new(Arc::clone(&store), guard.telemetry(), config.controller_config()?);
    manager.start();

    let state = AppState::new(store, registry);
    state.set_ready(true);

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let http_addr = config.http_addr;
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        if let Err(e) = http::serve(state, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(
        http_addr = %config.http_addr,
        extensions = config.extensions,
        "Controller ready"
    );

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    let _ = shutdown_tx.send(());
    manager.shutdown().await;
    let _ = http_handle.await;
    guard.shutdown();

    tracing::info!("Controller shutdown complete");
    Ok(())
}

//! Vantage Server - Main entry point
//!
//! Experiment lifecycle and live statistics engine for A/B testing.

use std::net::SocketAddr;
use std::sync::Arc;

use vantage_core::{
    api::{self, AppState},
    config::Config,
    lifecycle::LifecycleManager,
    live::LiveBroadcaster,
    store::{ExperimentStore, ListFilter, MemoryStore},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    // Initialize logging
    telemetry::init(
        &config.observability.log_level,
        config.observability.log_format,
    )?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Vantage Server"
    );

    // Wire the engine
    let store: Arc<dyn ExperimentStore> = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(LiveBroadcaster::new(config.engine.channel_capacity));
    let lifecycle = Arc::new(LifecycleManager::new(store, broadcaster.clone()));

    spawn_background_tasks(lifecycle.clone(), broadcaster.clone(), &config);

    // Build router
    let app_state = AppState {
        lifecycle,
        broadcaster,
    };
    let app = api::build_router(app_state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Start the duration-expiry sweep and the idle-channel cleanup loops.
///
/// One task each per server: expiry is evaluated lazily on mutation and by
/// this sweep, never by per-connection timers.
fn spawn_background_tasks(
    lifecycle: Arc<LifecycleManager>,
    broadcaster: Arc<LiveBroadcaster>,
    config: &Config,
) {
    let sweep_interval = config.engine.sweep_interval;
    let sweeper = lifecycle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            if let Err(e) = sweeper.sweep_expired().await {
                tracing::warn!(error = %e, "Expiry sweep failed");
            }
        }
    });

    let cleanup_interval = config.engine.cleanup_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        loop {
            interval.tick().await;
            let running = match lifecycle
                .list(ListFilter {
                    status: Some(vantage_core::experiment::ExperimentStatus::Running),
                })
                .await
            {
                Ok(experiments) => experiments.iter().map(|e| e.id).collect::<Vec<_>>(),
                Err(e) => {
                    tracing::warn!(error = %e, "Idle channel cleanup failed to list experiments");
                    continue;
                }
            };
            broadcaster.cleanup_idle(|id| running.contains(id)).await;
        }
    });
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

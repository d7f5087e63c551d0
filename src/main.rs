use std::process;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use sse_relay_service::config::Settings;
use sse_relay_service::server::{create_app, AppState};
use sse_relay_service::store::create_store;
use sse_relay_service::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!(
        server_id = %settings.server.server_id,
        store = %settings.store.backend,
        "Configuration loaded"
    );
    if settings.uses_dev_secret() {
        tracing::warn!("JWT secret is the development default; set JWT_SECRET in production");
    }

    // Create application state
    let store = create_store(&settings)?;
    let state = AppState::new(settings.clone(), store).await?;
    tracing::info!("Application state initialized");

    if let Err(e) = state.heartbeat.register_liveness().await {
        tracing::warn!(error = %e, "Failed to register liveness marker");
    }

    // Keep the liveness marker fresh in the background
    let liveness_handle = tokio::spawn(
        state
            .heartbeat
            .clone()
            .run_liveness(state.shutdown_tx.subscribe()),
    );

    // Create Axum app
    let app = create_app(state.clone());

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // The listener keeps answering (and rejecting new streams) while draining
    axum::serve(listener, app)
        .with_graceful_shutdown(drain_on_signal(state))
        .await?;

    // Wait for background tasks to finish
    tracing::info!("Waiting for background tasks to finish...");
    let _ = liveness_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn drain_on_signal(state: AppState) {
    shutdown_signal().await;

    let hard_timeout = state.drain.hard_timeout();
    tokio::spawn(async move {
        tokio::time::sleep(hard_timeout).await;
        tracing::error!(
            timeout_ms = hard_timeout.as_millis() as u64,
            "Drain did not finish in time, exiting"
        );
        process::exit(1);
    });

    state.drain.drain().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, draining");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, draining");
        }
    }
}

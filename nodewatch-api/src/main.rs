//! Nodewatch API Server Entry Point
//!
//! Loads configuration, starts the refresh scheduler and alert monitors, and
//! serves the Axum router until Ctrl-C.

use std::sync::Arc;

use axum::Router;
use nodewatch_api::{create_api_router, ApiConfig, ApiError, ApiResult, AppState, DockerExecTransport};
use tokio::sync::watch;

use nodewatch_api::telemetry::{init_tracer, TelemetryConfig};

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracer(&telemetry_config)?;

    let config = ApiConfig::from_env()?;
    let addr = config.bind_addr()?;

    let transport = Arc::new(DockerExecTransport::new(
        config.container.clone(),
        config.ros_setup.clone(),
        config.command_timeout,
    ));
    tracing::info!(container = %config.container, "Using docker exec transport");

    let state = AppState::build(config, transport)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = Arc::clone(&state.scheduler).spawn(shutdown_rx.clone());
    let alerts_handle = state.alerts.spawn(
        Arc::clone(&state.inspector),
        Arc::clone(&state.hub),
        state.config.node_poll_interval,
        shutdown_rx,
    );
    let hub = Arc::clone(&state.hub);

    let app: Router = create_api_router(state);

    tracing::info!(%addr, "Starting nodewatch API server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    hub.shutdown();
    if let Err(e) = scheduler_handle.await {
        tracing::warn!(error = %e, "Refresh scheduler ended abnormally");
    }
    if let Err(e) = alerts_handle.await {
        tracing::warn!(error = %e, "Alert monitors ended abnormally");
    }

    tracing::info!("Nodewatch API stopped");
    Ok(())
}

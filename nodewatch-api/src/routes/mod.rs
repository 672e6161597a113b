//! REST API Routes Module
//!
//! Route handlers organized by resource:
//! - Node inspection and shutdown under /api/v1/nodes
//! - Cache counters and invalidation under /api/v1/cache
//! - Refresh task status under /api/v1/refresh
//! - Log source status under /api/v1/logs
//! - Recent alerts under /api/v1/alerts
//! - Health check endpoints (Kubernetes-compatible)
//! - WebSocket streams under /ws
//! - CORS support for the browser dashboard

pub mod alerts;
pub mod cache;
pub mod health;
pub mod logs;
pub mod nodes;
pub mod refresh;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    middleware::from_fn,
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::config::ApiConfig;
use crate::state::AppState;
use crate::telemetry::{metrics_handler, metrics::MetricsState, observability_middleware};
use crate::ws;

// Re-export route creation functions for convenience
pub use alerts::create_router as alerts_router;
pub use cache::create_router as cache_router;
pub use health::create_router as health_router;
pub use logs::create_router as logs_router;
pub use nodes::create_router as nodes_router;
pub use refresh::create_router as refresh_router;

// ============================================================================
// CORS LAYER
// ============================================================================

/// Build the CORS layer from ApiConfig.
///
/// With no configured origins every origin is allowed. Otherwise only the
/// configured origins are.
fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: allowing all origins");
        cors.allow_origin(Any)
    } else {
        tracing::info!(origins = ?config.cors_origins, "CORS: restricting origins");
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(origin) => Some(origin),
                Err(_) => {
                    tracing::warn!(origin = %o, "Ignoring unparsable CORS origin");
                    None
                }
            })
            .collect();
        cors.allow_origin(origins)
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create the complete API router.
///
/// - REST routes under /api/v1/*
/// - Live logs at /ws/logs and /ws/logs/{node}, node status at /ws/nodes,
///   alerts at /ws/alerts
/// - Health checks at /health/*
/// - Metrics at /metrics
pub fn create_api_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .nest("/nodes", nodes::create_router(Arc::clone(&state.inspector)))
        .nest("/cache", cache::create_router(state.cache.clone()))
        .nest("/refresh", refresh::create_router(Arc::clone(&state.scheduler)))
        .nest("/logs", logs::create_router(Arc::clone(&state.hub)))
        .nest("/alerts", alerts::create_router(Arc::clone(&state.alerts)));

    let ws_routes = Router::new()
        .route("/logs", get(ws::logs_handler))
        .route("/logs/*node", get(ws::node_logs_handler))
        .route("/nodes", get(ws::nodes_handler))
        .route("/alerts", get(ws::alerts_handler))
        .with_state(Arc::clone(&state.ws));

    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(MetricsState {
            cache: state.cache.clone(),
            hub: Arc::clone(&state.hub),
        });

    let router = Router::new()
        .nest("/api/v1", api_routes)
        .nest("/ws", ws_routes)
        .nest(
            "/health",
            health::create_router(
                Arc::clone(&state.scheduler),
                Arc::clone(&state.hub),
                state.start_time,
            ),
        )
        .merge(metrics_routes);

    let cors = build_cors_layer(&state.config);

    // Execution order: CORS -> Observability -> Handler
    router
        .layer(from_fn(observability_middleware))
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_layer_builds_with_origins() {
        let config = ApiConfig {
            cors_origins: vec!["http://localhost:3000".to_string(), "not a header\n".to_string()],
            ..ApiConfig::default()
        };
        let _ = build_cors_layer(&config);
    }
}

//! Health Check Endpoints
//!
//! Provides Kubernetes-compatible health check endpoints:
//! - /health/ping - Simple liveness check
//! - /health/ready - Node list refresh and log pipeline check
//! - /health/live - Process alive check

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use nodewatch_cache::CacheKey;
use nodewatch_logs::{LogHub, PumpState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use crate::state::InspectionScheduler;

// ============================================================================
// TYPES
// ============================================================================

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthDetails {
    /// Background refresh of the node list.
    pub node_refresh: ComponentHealth,
    /// Log ingestion, healthy while every opened source is streaming.
    pub log_sources: ComponentHealth,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            error: None,
        }
    }

    fn with_error(status: HealthStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Clone)]
pub struct HealthState {
    pub scheduler: Arc<InspectionScheduler>,
    pub hub: Arc<LogHub>,
    pub start_time: Instant,
}

impl HealthState {
    pub fn new(scheduler: Arc<InspectionScheduler>, hub: Arc<LogHub>, start_time: Instant) -> Self {
        Self {
            scheduler,
            hub,
            start_time,
        }
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health/ping - Simple pong response
pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}

/// GET /health/live - Process liveness check
pub async fn liveness() -> impl IntoResponse {
    let response = HealthResponse {
        status: HealthStatus::Healthy,
        message: Some("Process is alive".to_string()),
        details: None,
    };
    (StatusCode::OK, Json(response))
}

/// GET /health/ready - Readiness check
///
/// Not ready until the node list has been fetched once. A log source that is
/// reconnecting only degrades the result.
pub async fn readiness(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let node_refresh = check_node_refresh(&state.scheduler);
    let log_sources = check_log_sources(&state.hub);

    let overall_status = match (node_refresh.status, log_sources.status) {
        (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
        (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    };

    let response = HealthResponse {
        status: overall_status,
        message: None,
        details: Some(HealthDetails {
            node_refresh,
            log_sources,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
        }),
    };

    let status_code = if overall_status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status_code, Json(response))
}

fn check_node_refresh(scheduler: &InspectionScheduler) -> ComponentHealth {
    let key = CacheKey::node_list();
    match scheduler.status(key.as_str()) {
        None => ComponentHealth::with_error(HealthStatus::Unhealthy, "Node list refresh not registered"),
        Some(status) if status.last_success_at.is_some() && status.last_error.is_none() => {
            ComponentHealth::healthy()
        }
        // Served from the last good value until the next success.
        Some(status) if status.last_success_at.is_some() => ComponentHealth::with_error(
            HealthStatus::Degraded,
            status.last_error.unwrap_or_default(),
        ),
        Some(status) => ComponentHealth::with_error(
            HealthStatus::Unhealthy,
            status
                .last_error
                .unwrap_or_else(|| "Node list not fetched yet".to_string()),
        ),
    }
}

fn check_log_sources(hub: &LogHub) -> ComponentHealth {
    let down: Vec<String> = hub
        .statuses()
        .into_iter()
        .filter(|channel| channel.pump.state != PumpState::Streaming)
        .map(|channel| channel.source_id)
        .collect();

    if down.is_empty() {
        ComponentHealth::healthy()
    } else {
        ComponentHealth::with_error(
            HealthStatus::Degraded,
            format!("Not streaming: {}", down.join(", ")),
        )
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create health check router
pub fn create_router(
    scheduler: Arc<InspectionScheduler>,
    hub: Arc<LogHub>,
    start_time: Instant,
) -> Router {
    let state = Arc::new(HealthState::new(scheduler, hub, start_time));

    Router::new()
        .route("/ping", get(ping))
        .route("/live", get(liveness))
        .route("/ready", get(readiness))
        .with_state(state)
}

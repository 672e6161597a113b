//! Log source status.
//!
//! Live records are only served over `/ws/logs`; this exposes the state of
//! each ingestion pump and its subscribers.

use axum::{extract::State, routing::get, Json, Router};
use nodewatch_logs::{ChannelStatus, LogHub};
use std::sync::Arc;

/// GET /api/v1/logs/sources
pub async fn list_sources(State(hub): State<Arc<LogHub>>) -> Json<Vec<ChannelStatus>> {
    let mut sources = hub.statuses();
    sources.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    Json(sources)
}

pub fn create_router(hub: Arc<LogHub>) -> Router {
    Router::new()
        .route("/sources", get(list_sources))
        .with_state(hub)
}

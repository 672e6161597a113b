//! Node REST API Routes
//!
//! Read endpoints go through the inspection cache; shutdown runs a command
//! and then drops the node's cached entries.

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    error::{ApiError, ApiResult},
    inspect::{LifecycleStateResponse, NodeDetail, NodeInspector, NodeListing, ShutdownOutcome},
};

// ============================================================================
// REQUEST TYPES
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ListNodesQuery {
    /// Accept an expired node list instead of waiting on a fetch.
    #[serde(default)]
    pub stale: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeNameQuery {
    pub name: Option<String>,
    #[serde(default)]
    pub stale: bool,
}

impl NodeNameQuery {
    fn name(&self) -> ApiResult<&str> {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(ApiError::missing_field("name")),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ShutdownRequest {
    pub name: String,
    /// Kill the process of a non-lifecycle node.
    #[serde(default)]
    pub force: bool,
}

// ============================================================================
// ROUTE HANDLERS
// ============================================================================

/// GET /api/v1/nodes - List running nodes
pub async fn list_nodes(
    State(inspector): State<Arc<NodeInspector>>,
    Query(query): Query<ListNodesQuery>,
) -> ApiResult<Json<NodeListing>> {
    let listing = inspector.list_nodes(query.stale).await?;
    Ok(Json(listing))
}

/// GET /api/v1/nodes/detail?name=/node - Topics, services and parameters
///
/// Node names contain slashes, so they travel in the query string.
pub async fn get_node(
    State(inspector): State<Arc<NodeInspector>>,
    Query(query): Query<NodeNameQuery>,
) -> ApiResult<Json<NodeDetail>> {
    let detail = inspector.node_detail(query.name()?).await?;
    Ok(Json(detail))
}

/// GET /api/v1/nodes/lifecycle?name=/node - Lifecycle state
pub async fn get_lifecycle_state(
    State(inspector): State<Arc<NodeInspector>>,
    Query(query): Query<NodeNameQuery>,
) -> ApiResult<Json<LifecycleStateResponse>> {
    let state = inspector.lifecycle_state(query.name()?, query.stale).await?;
    Ok(Json(state))
}

/// POST /api/v1/nodes/shutdown - Shut a node down
pub async fn shutdown_node(
    State(inspector): State<Arc<NodeInspector>>,
    Json(req): Json<ShutdownRequest>,
) -> ApiResult<Json<ShutdownOutcome>> {
    if req.name.trim().is_empty() {
        return Err(ApiError::missing_field("name"));
    }

    let outcome = inspector.shutdown_node(&req.name, req.force).await?;
    Ok(Json(outcome))
}

// ============================================================================
// ROUTER
// ============================================================================

/// Create the node routes router.
pub fn create_router(inspector: Arc<NodeInspector>) -> Router {
    Router::new()
        .route("/", get(list_nodes))
        .route("/detail", get(get_node))
        .route("/lifecycle", get(get_lifecycle_state))
        .route("/shutdown", post(shutdown_node))
        .with_state(inspector)
}

//! Background refresh task status.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use nodewatch_cache::RefreshTaskStatus;
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    error::{ApiError, ApiResult},
    state::InspectionScheduler,
};

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    pub key: Option<String>,
}

/// GET /api/v1/refresh/tasks - Every registered task, sorted by key
pub async fn list_tasks(
    State(scheduler): State<Arc<InspectionScheduler>>,
) -> Json<Vec<RefreshTaskStatus>> {
    let mut tasks = scheduler.statuses();
    tasks.sort_by(|a, b| a.key.cmp(&b.key));
    Json(tasks)
}

/// GET /api/v1/refresh/task?key=node_list:all
pub async fn get_task(
    State(scheduler): State<Arc<InspectionScheduler>>,
    Query(query): Query<TaskQuery>,
) -> ApiResult<Json<RefreshTaskStatus>> {
    let key = query.key.ok_or_else(|| ApiError::missing_field("key"))?;
    scheduler
        .status(&key)
        .map(Json)
        .ok_or_else(|| ApiError::invalid_input(format!("No refresh task for key '{}'", key)))
}

pub fn create_router(scheduler: Arc<InspectionScheduler>) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks))
        .route("/task", get(get_task))
        .with_state(scheduler)
}

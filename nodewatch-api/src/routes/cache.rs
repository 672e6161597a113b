//! Cache REST API Routes
//!
//! Counters and manual invalidation for the inspection cache.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use nodewatch_cache::CacheStats;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    state::InspectionCache,
};

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsResponse {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub hit_rate: f64,
    pub keys: Vec<String>,
}

/// Drop one key or every key under a prefix.
#[derive(Debug, Default, Deserialize)]
pub struct InvalidateRequest {
    pub key: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

/// GET /api/v1/cache/stats
pub async fn get_stats(State(cache): State<InspectionCache>) -> Json<CacheStatsResponse> {
    let stats = cache.stats();
    let mut keys = cache.keys();
    keys.sort();
    Json(CacheStatsResponse {
        hit_rate: stats.hit_rate(),
        stats,
        keys,
    })
}

/// POST /api/v1/cache/invalidate
pub async fn invalidate(
    State(cache): State<InspectionCache>,
    Json(req): Json<InvalidateRequest>,
) -> ApiResult<Json<InvalidateResponse>> {
    let removed = match (req.key, req.prefix) {
        (Some(_), Some(_)) => {
            return Err(ApiError::invalid_input("Give either key or prefix, not both"));
        }
        (Some(key), None) => usize::from(cache.invalidate(&key)),
        (None, Some(prefix)) if prefix.is_empty() => {
            return Err(ApiError::invalid_format("prefix", "non-empty string"));
        }
        (None, Some(prefix)) => cache.invalidate_prefix(&prefix),
        (None, None) => return Err(ApiError::missing_field("key")),
    };

    tracing::info!(removed, "Cache invalidated");
    Ok(Json(InvalidateResponse { removed }))
}

/// Create the cache routes router.
pub fn create_router(cache: InspectionCache) -> Router {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/invalidate", post(invalidate))
        .with_state(cache)
}

//! Recent alerts.
//!
//! Live alerts are pushed over `/ws/alerts`; this serves the history kept by
//! the alert service, for clients that connect late.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::alerts::{Alert, AlertService, AlertSeverity, AlertStats};

#[derive(Debug, Default, Deserialize)]
pub struct AlertQuery {
    /// Only alerts at or above this severity.
    pub min_severity: Option<AlertSeverity>,
}

#[derive(Debug, Serialize)]
pub struct AlertHistory {
    pub alerts: Vec<Alert>,
    pub stats: AlertStats,
}

/// GET /api/v1/alerts?min_severity=warning - Recent alerts, oldest first
pub async fn list_alerts(
    State(alerts): State<Arc<AlertService>>,
    Query(query): Query<AlertQuery>,
) -> Json<AlertHistory> {
    let recent = alerts
        .recent()
        .into_iter()
        .filter(|alert| query.min_severity.map_or(true, |min| alert.severity >= min))
        .collect();
    Json(AlertHistory {
        alerts: recent,
        stats: alerts.stats(),
    })
}

pub fn create_router(alerts: Arc<AlertService>) -> Router {
    Router::new()
        .route("/", get(list_alerts))
        .with_state(alerts)
}

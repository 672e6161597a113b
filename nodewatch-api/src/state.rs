//! Shared application state for Axum routers.

use std::sync::Arc;
use std::time::Instant;

use nodewatch_cache::{RefreshScheduler, TtlCache};
use nodewatch_logs::LogHub;
use serde_json::Value;

use crate::alerts::AlertService;
use crate::config::ApiConfig;
use crate::inspect::NodeInspector;
use crate::transport::{CommandTransport, TopicEchoSource};
use crate::ws::WsState;

/// Cache holding parsed inspection output, keyed by [`nodewatch_cache::CacheKey`].
pub type InspectionCache = TtlCache<Value>;

/// Scheduler keeping hot inspection keys warm.
pub type InspectionScheduler = RefreshScheduler<Value>;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    pub cache: InspectionCache,
    pub inspector: Arc<NodeInspector>,
    pub scheduler: Arc<InspectionScheduler>,
    /// One ingestion pump per log source, shared by every WebSocket client.
    pub hub: Arc<LogHub>,
    pub alerts: Arc<AlertService>,
    pub ws: Arc<WsState>,
    pub start_time: Instant,
}

impl AppState {
    /// Wire the cache, scheduler, inspector, log hub and alerts around one
    /// transport.
    ///
    /// Registers the background refresh of the node and service lists; the
    /// scheduler and the alert monitors are started by the caller.
    pub fn build(config: ApiConfig, transport: Arc<dyn CommandTransport>) -> Result<Self, nodewatch_core::ConfigError> {
        let cache = InspectionCache::new(config.cache_config());
        let scheduler = Arc::new(InspectionScheduler::new(cache.clone(), config.scheduler_config()));
        let inspector = Arc::new(NodeInspector::new(
            Arc::clone(&transport),
            cache.clone(),
            config.max_staleness,
        ));
        inspector.register_refresh(&scheduler, config.node_poll_interval)?;

        let hub = Arc::new(LogHub::new(
            config.log_config(),
            Arc::new(TopicEchoSource::new(transport)),
        ));
        let alerts = Arc::new(AlertService::new(config.alerts.clone())?);
        let ws = Arc::new(WsState {
            hub: Arc::clone(&hub),
            alerts: Arc::clone(&alerts),
            inspector: Arc::clone(&inspector),
            send_timeout: config.ws_send_timeout,
            node_poll_interval: config.node_poll_interval,
        });

        Ok(Self {
            config: Arc::new(config),
            cache,
            inspector,
            scheduler,
            hub,
            alerts,
            ws,
            start_time: Instant::now(),
        })
    }
}

// Use macro to reduce boilerplate for FromRef implementations
crate::impl_from_ref!(Arc<ApiConfig>, config);
crate::impl_from_ref!(InspectionCache, cache);
crate::impl_from_ref!(Arc<NodeInspector>, inspector);
crate::impl_from_ref!(Arc<InspectionScheduler>, scheduler);
crate::impl_from_ref!(Arc<LogHub>, hub);
crate::impl_from_ref!(Arc<AlertService>, alerts);
crate::impl_from_ref!(Arc<WsState>, ws);
crate::impl_from_ref!(Instant, start_time);

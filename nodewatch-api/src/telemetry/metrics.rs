//! Prometheus Metrics Definitions
//!
//! Request metrics are recorded as requests complete. Cache and log pipeline
//! figures already live in their own stats snapshots, so they are copied into
//! gauges when `/metrics` is scraped.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use nodewatch_cache::CacheStats;
use nodewatch_logs::{ChannelStatus, LogHub, PumpState};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

use crate::error::{ApiError, ApiResult};
use crate::state::InspectionCache;

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s, 30s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<NodewatchMetrics>> = Lazy::new(NodewatchMetrics::new);

fn registration_error(name: &str, e: prometheus::Error) -> ApiError {
    ApiError::internal_error(format!("Failed to register {}: {}", name, e))
}

/// Container for all nodewatch metrics.
#[derive(Clone)]
pub struct NodewatchMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Current active WebSocket connections
    pub websocket_connections: Gauge,

    /// Cache counters - labels: stat
    pub cache_stats: GaugeVec,

    /// Log channel counters - labels: source, stat
    pub log_channel_stats: GaugeVec,

    /// 1 while a source's pump is streaming - labels: source
    pub log_source_up: GaugeVec,

    /// Alerts raised - labels: type, severity
    pub alerts_total: CounterVec,
}

impl NodewatchMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "nodewatch_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| registration_error("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "nodewatch_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_error("http_request_duration_seconds", e))?,

            websocket_connections: register_gauge!(
                "nodewatch_websocket_connections",
                "Current number of active WebSocket connections"
            )
            .map_err(|e| registration_error("websocket_connections", e))?,

            cache_stats: register_gauge_vec!(
                "nodewatch_cache_stats",
                "Inspection cache counters since startup",
                &["stat"]
            )
            .map_err(|e| registration_error("cache_stats", e))?,

            log_channel_stats: register_gauge_vec!(
                "nodewatch_log_channel_stats",
                "Log channel counters since startup",
                &["source", "stat"]
            )
            .map_err(|e| registration_error("log_channel_stats", e))?,

            log_source_up: register_gauge_vec!(
                "nodewatch_log_source_up",
                "Whether the log source is currently streaming",
                &["source"]
            )
            .map_err(|e| registration_error("log_source_up", e))?,

            alerts_total: register_counter_vec!(
                "nodewatch_alerts_total",
                "Alerts raised since startup",
                &["type", "severity"]
            )
            .map_err(|e| registration_error("alerts_total", e))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// Increment WebSocket connection count.
    pub fn ws_connected(&self) {
        self.websocket_connections.inc();
    }

    /// Decrement WebSocket connection count.
    pub fn ws_disconnected(&self) {
        self.websocket_connections.dec();
    }

    pub fn record_alert(&self, alert_type: &str, severity: &str) {
        self.alerts_total.with_label_values(&[alert_type, severity]).inc();
    }

    pub fn observe_cache(&self, stats: &CacheStats) {
        let values = [
            ("hits", stats.hits),
            ("misses", stats.misses),
            ("stale_hits", stats.stale_hits),
            ("coalesced", stats.coalesced),
            ("fetches", stats.fetches),
            ("fetch_errors", stats.fetch_errors),
            ("invalidations", stats.invalidations),
            ("entries", stats.entries),
        ];
        for (stat, value) in values {
            self.cache_stats.with_label_values(&[stat]).set(value as f64);
        }
    }

    pub fn observe_log_channels(&self, channels: &[ChannelStatus]) {
        for channel in channels {
            let source = channel.source_id.as_str();
            let values = [
                ("records", channel.pump.records),
                ("undecodable", channel.pump.undecodable),
                ("connect_attempts", channel.pump.connect_attempts),
                ("gaps", channel.pump.gaps),
                ("buffered", channel.buffered as u64),
                ("subscribers", channel.fanout.subscribers as u64),
                ("delivered", channel.fanout.delivered),
                ("dropped", channel.fanout.dropped),
            ];
            for (stat, value) in values {
                self.log_channel_stats
                    .with_label_values(&[source, stat])
                    .set(value as f64);
            }
            let up = if channel.pump.state == PumpState::Streaming { 1.0 } else { 0.0 };
            self.log_source_up.with_label_values(&[source]).set(up);
        }
    }
}

/// State for the `/metrics` handler.
#[derive(Clone)]
pub struct MetricsState {
    pub cache: InspectionCache,
    pub hub: Arc<LogHub>,
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    match METRICS.as_ref() {
        Ok(metrics) => {
            metrics.observe_cache(&state.cache.stats());
            metrics.observe_log_channels(&state.hub.statuses());
        }
        Err(e) => tracing::error!(error = %e, "Metrics unavailable"),
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

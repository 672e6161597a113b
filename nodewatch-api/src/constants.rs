//! Constants for the nodewatch API
//!
//! Defaults for the service configuration. Each can be overridden through a
//! `NODEWATCH_*` environment variable (see [`ApiConfig::from_env`](crate::ApiConfig::from_env)).

// ============================================================================
// SERVER
// ============================================================================

/// Default bind address.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default CORS max age in seconds (24 hours)
pub const DEFAULT_CORS_MAX_AGE_SECS: u64 = 86400;

// ============================================================================
// DOCKER TRANSPORT
// ============================================================================

/// Container running the ROS2 graph.
pub const DEFAULT_CONTAINER: &str = "tram_autoware";

/// Script sourced before every ROS2 command.
pub const DEFAULT_ROS_SETUP: &str = "/opt/ros/humble/setup.bash";

/// Upper bound for one `docker exec` call (seconds).
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// REFRESH
// ============================================================================

/// Background refresh interval for the node list (seconds).
pub const DEFAULT_NODE_POLL_INTERVAL_SECS: u64 = 5;

/// Scheduler tick resolution (milliseconds).
pub const DEFAULT_SCHEDULER_TICK_MS: u64 = 250;

/// How far past expiry a `?stale=true` read may reach (seconds).
pub const DEFAULT_MAX_STALENESS_SECS: u64 = 60;

// ============================================================================
// LOG STREAMING
// ============================================================================

/// A WebSocket write that takes longer than this closes the connection (seconds).
pub const DEFAULT_WS_SEND_TIMEOUT_SECS: u64 = 5;

/// First reconnect delay of the log pump (milliseconds).
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1000;

/// Reconnect delay cap of the log pump (milliseconds).
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

// ============================================================================
// ALERTS
// ============================================================================

/// Minimum time between two alerts with the same key (seconds).
pub const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 60;

/// Alerts kept for `GET /api/v1/alerts` and buffered per `/ws/alerts` client.
pub const DEFAULT_ALERT_HISTORY: usize = 100;

/// Log messages longer than this are cut in the alert text (characters).
pub const ALERT_MESSAGE_PREVIEW_CHARS: usize = 150;

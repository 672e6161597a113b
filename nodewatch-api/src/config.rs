//! API Configuration Module
//!
//! Service configuration loaded from `NODEWATCH_*` environment variables with
//! defaults suitable for a local Docker setup. The library crates get their
//! own config structs derived from this one.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use nodewatch_cache::{CacheConfig, SchedulerConfig};
use nodewatch_core::constants::{
    DEFAULT_CACHE_TTL_SECS, DEFAULT_REPLAY_SIZE, DEFAULT_RING_CAPACITY, DEFAULT_SUBSCRIBER_QUEUE,
    ROSOUT_SOURCE,
};
use nodewatch_core::ConfigError;
use nodewatch_logs::{BackoffConfig, LogConfig};

use crate::alerts::AlertConfig;
use crate::constants::*;
use crate::transport::is_topic_name;

// ============================================================================
// API CONFIGURATION
// ============================================================================

/// Service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    // ========================================================================
    // Server
    // ========================================================================
    pub bind_host: String,
    pub port: u16,

    /// Allowed CORS origins. Empty means allow all origins.
    pub cors_origins: Vec<String>,
    pub cors_max_age_secs: u64,

    // ========================================================================
    // Docker transport
    // ========================================================================
    pub container: String,
    pub ros_setup: String,
    pub command_timeout: Duration,

    // ========================================================================
    // Cache and refresh
    // ========================================================================
    pub cache_ttl: Duration,
    pub node_poll_interval: Duration,
    pub scheduler_tick: Duration,
    /// Oldest expired value a stale-tolerant read may return.
    pub max_staleness: Duration,

    // ========================================================================
    // Log streaming
    // ========================================================================
    pub ring_capacity: usize,
    pub replay_size: usize,
    pub subscriber_queue: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub ws_send_timeout: Duration,
    /// Topics clients may stream. Each one costs a long-running echo process.
    pub log_sources: Vec<String>,

    // ========================================================================
    // Alerts
    // ========================================================================
    pub alerts: AlertConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_origins: Vec::new(),
            cors_max_age_secs: DEFAULT_CORS_MAX_AGE_SECS,

            container: DEFAULT_CONTAINER.to_string(),
            ros_setup: DEFAULT_ROS_SETUP.to_string(),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),

            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            node_poll_interval: Duration::from_secs(DEFAULT_NODE_POLL_INTERVAL_SECS),
            scheduler_tick: Duration::from_millis(DEFAULT_SCHEDULER_TICK_MS),
            max_staleness: Duration::from_secs(DEFAULT_MAX_STALENESS_SECS),

            ring_capacity: DEFAULT_RING_CAPACITY,
            replay_size: DEFAULT_REPLAY_SIZE,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            reconnect_initial: Duration::from_millis(DEFAULT_RECONNECT_INITIAL_MS),
            reconnect_max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            ws_send_timeout: Duration::from_secs(DEFAULT_WS_SEND_TIMEOUT_SECS),
            log_sources: vec![ROSOUT_SOURCE.to_string()],

            alerts: AlertConfig::default(),
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `NODEWATCH_BIND`: Bind address (default: 0.0.0.0)
    /// - `NODEWATCH_PORT` or `PORT`: HTTP port (default: 8080)
    /// - `NODEWATCH_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    /// - `NODEWATCH_CORS_MAX_AGE_SECS`: Preflight cache duration (default: 86400)
    /// - `NODEWATCH_CONTAINER`: Docker container name (default: tram_autoware)
    /// - `NODEWATCH_ROS_SETUP`: ROS setup script (default: /opt/ros/humble/setup.bash)
    /// - `NODEWATCH_COMMAND_TIMEOUT_SECS`: docker exec timeout (default: 30)
    /// - `NODEWATCH_CACHE_TTL_SECS`: Cache time-to-live (default: 5)
    /// - `NODEWATCH_NODE_POLL_INTERVAL_SECS`: Node list refresh interval (default: 5)
    /// - `NODEWATCH_SCHEDULER_TICK_MS`: Scheduler resolution (default: 250)
    /// - `NODEWATCH_MAX_STALENESS_SECS`: Stale read window (default: 60)
    /// - `NODEWATCH_LOG_BUFFER`: Records kept per log source (default: 1000)
    /// - `NODEWATCH_REPLAY_SIZE`: Backlog sent to new subscribers (default: 100)
    /// - `NODEWATCH_SUBSCRIBER_QUEUE`: Per-subscriber queue depth (default: 256)
    /// - `NODEWATCH_RECONNECT_INITIAL_MS` / `NODEWATCH_RECONNECT_MAX_MS`: Log
    ///   stream reconnect backoff (default: 1000 / 30000)
    /// - `NODEWATCH_WS_SEND_TIMEOUT_SECS`: WebSocket write timeout (default: 5)
    /// - `NODEWATCH_LOG_SOURCES`: Comma-separated streamable topics (default: /rosout)
    /// - `NODEWATCH_ALERTS_FILE`: YAML alert settings (default: none, no patterns)
    /// - `NODEWATCH_ALERTS_ENABLED`: Overrides `enabled` from the file (default: true)
    /// - `NODEWATCH_ALERT_COOLDOWN_SECS`: Overrides `cooldown_seconds` (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unset variables take their default;
    /// set but unparsable ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Lookup(lookup);

        let cors_origins = env.list("NODEWATCH_CORS_ORIGINS").unwrap_or_default();
        let log_sources = env.list("NODEWATCH_LOG_SOURCES").unwrap_or(defaults.log_sources);

        let mut alerts = match env.get("NODEWATCH_ALERTS_FILE") {
            Some(path) => AlertConfig::load(std::path::Path::new(&path))?,
            None => defaults.alerts,
        };
        alerts.enabled = env.parse("NODEWATCH_ALERTS_ENABLED", alerts.enabled)?;
        alerts.cooldown_seconds = env.parse("NODEWATCH_ALERT_COOLDOWN_SECS", alerts.cooldown_seconds)?;

        let port = match env.get("NODEWATCH_PORT") {
            Some(_) => env.parse("NODEWATCH_PORT", defaults.port)?,
            None => env.parse("PORT", defaults.port)?,
        };

        let config = Self {
            bind_host: env.get("NODEWATCH_BIND").unwrap_or(defaults.bind_host),
            port,
            cors_origins,
            cors_max_age_secs: env.parse("NODEWATCH_CORS_MAX_AGE_SECS", defaults.cors_max_age_secs)?,

            container: env.get("NODEWATCH_CONTAINER").unwrap_or(defaults.container),
            ros_setup: env.get("NODEWATCH_ROS_SETUP").unwrap_or(defaults.ros_setup),
            command_timeout: env.secs("NODEWATCH_COMMAND_TIMEOUT_SECS", defaults.command_timeout)?,

            cache_ttl: env.secs("NODEWATCH_CACHE_TTL_SECS", defaults.cache_ttl)?,
            node_poll_interval: env
                .secs("NODEWATCH_NODE_POLL_INTERVAL_SECS", defaults.node_poll_interval)?,
            scheduler_tick: env.millis("NODEWATCH_SCHEDULER_TICK_MS", defaults.scheduler_tick)?,
            max_staleness: env.secs("NODEWATCH_MAX_STALENESS_SECS", defaults.max_staleness)?,

            ring_capacity: env.parse("NODEWATCH_LOG_BUFFER", defaults.ring_capacity)?,
            replay_size: env.parse("NODEWATCH_REPLAY_SIZE", defaults.replay_size)?,
            subscriber_queue: env.parse("NODEWATCH_SUBSCRIBER_QUEUE", defaults.subscriber_queue)?,
            reconnect_initial: env
                .millis("NODEWATCH_RECONNECT_INITIAL_MS", defaults.reconnect_initial)?,
            reconnect_max: env.millis("NODEWATCH_RECONNECT_MAX_MS", defaults.reconnect_max)?,
            ws_send_timeout: env.secs("NODEWATCH_WS_SEND_TIMEOUT_SECS", defaults.ws_send_timeout)?,
            log_sources,

            alerts,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.container.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "NODEWATCH_CONTAINER".to_string(),
            });
        }

        let positive = [
            ("NODEWATCH_COMMAND_TIMEOUT_SECS", self.command_timeout),
            ("NODEWATCH_NODE_POLL_INTERVAL_SECS", self.node_poll_interval),
            ("NODEWATCH_SCHEDULER_TICK_MS", self.scheduler_tick),
            ("NODEWATCH_WS_SEND_TIMEOUT_SECS", self.ws_send_timeout),
        ];
        for (field, value) in positive {
            if value.is_zero() {
                return Err(invalid(field, "0", "must be greater than zero"));
            }
        }

        if self.ring_capacity == 0 {
            return Err(invalid("NODEWATCH_LOG_BUFFER", "0", "must be greater than zero"));
        }
        if self.subscriber_queue == 0 {
            return Err(invalid("NODEWATCH_SUBSCRIBER_QUEUE", "0", "must be greater than zero"));
        }
        if self.replay_size > self.ring_capacity {
            return Err(invalid(
                "NODEWATCH_REPLAY_SIZE",
                &self.replay_size.to_string(),
                &format!("cannot exceed the log buffer size {}", self.ring_capacity),
            ));
        }
        if self.log_sources.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "NODEWATCH_LOG_SOURCES".to_string(),
            });
        }
        if let Some(bad) = self.log_sources.iter().find(|s| !is_topic_name(s)) {
            return Err(invalid("NODEWATCH_LOG_SOURCES", bad, "expected a topic name like /rosout"));
        }
        self.alerts.validate()?;
        if self.reconnect_initial > self.reconnect_max {
            return Err(invalid(
                "NODEWATCH_RECONNECT_INITIAL_MS",
                &self.reconnect_initial.as_millis().to_string(),
                "cannot exceed NODEWATCH_RECONNECT_MAX_MS",
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.bind_host, self.port);
        addr.parse::<SocketAddr>()
            .map_err(|e| invalid("NODEWATCH_BIND", &addr, &e.to_string()))
    }

    /// Check if running with an explicit origin allow-list.
    pub fn is_production(&self) -> bool {
        !self.cors_origins.is_empty()
    }

    // ========================================================================
    // Library configs
    // ========================================================================

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .with_default_ttl(self.cache_ttl)
            .with_fetch_timeout(self.command_timeout)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default().with_tick(self.scheduler_tick)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::default()
            .with_ring_capacity(self.ring_capacity)
            .with_replay_size(self.replay_size)
            .with_subscriber_queue(self.subscriber_queue)
            .with_backoff(
                BackoffConfig::default()
                    .with_initial(self.reconnect_initial)
                    .with_max(self.reconnect_max),
            )
            .with_sources(self.log_sources.iter().cloned())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Typed access to a variable source.
struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    /// Comma-separated values, blanks skipped. `None` when unset.
    fn list(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            Some(raw) => raw.parse().map_err(|e: T::Err| invalid(name, &raw, &e.to_string())),
            None => Ok(default),
        }
    }

    fn secs(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(name, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(name, default.as_millis() as u64).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<ApiConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ApiConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config, ApiConfig::default());
        assert_eq!(config.port, 8080);
        assert_eq!(config.container, "tram_autoware");
        assert_eq!(config.node_poll_interval, Duration::from_secs(5));
        assert_eq!(config.command_timeout, Duration::from_secs(30));
        assert!(!config.is_production());
    }

    #[test]
    fn test_overrides() {
        let config = from_vars(&[
            ("NODEWATCH_PORT", "9000"),
            ("NODEWATCH_CONTAINER", "robot"),
            ("NODEWATCH_CACHE_TTL_SECS", "10"),
            ("NODEWATCH_SCHEDULER_TICK_MS", "100"),
            ("NODEWATCH_LOG_BUFFER", "50"),
            ("NODEWATCH_REPLAY_SIZE", "20"),
            ("NODEWATCH_CORS_ORIGINS", "https://a.example, https://b.example,"),
        ])
        .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.container, "robot");
        assert_eq!(config.cache_ttl, Duration::from_secs(10));
        assert_eq!(config.scheduler_tick, Duration::from_millis(100));
        assert_eq!(config.log_config().ring_capacity, 50);
        assert_eq!(config.log_config().replay_size, 20);
        assert_eq!(config.cors_origins, vec!["https://a.example", "https://b.example"]);
        assert!(config.is_production());
    }

    #[test]
    fn test_port_fallback() {
        assert_eq!(from_vars(&[("PORT", "3000")]).unwrap().port, 3000);
        let config = from_vars(&[("PORT", "3000"), ("NODEWATCH_PORT", "4000")]).unwrap();
        assert_eq!(config.port, 4000);
    }

    #[test]
    fn test_unparsable_value_is_rejected() {
        let err = from_vars(&[("NODEWATCH_CACHE_TTL_SECS", "soon")]).unwrap_err();
        match err {
            ConfigError::InvalidValue { field, value, .. } => {
                assert_eq!(field, "NODEWATCH_CACHE_TTL_SECS");
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            from_vars(&[("NODEWATCH_NODE_POLL_INTERVAL_SECS", "0")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            from_vars(&[("NODEWATCH_LOG_BUFFER", "10"), ("NODEWATCH_REPLAY_SIZE", "11")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            from_vars(&[("NODEWATCH_RECONNECT_INITIAL_MS", "60000")]),
            Err(ConfigError::InvalidValue { .. })
        ));

        let config = ApiConfig {
            container: " ".to_string(),
            ..ApiConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired { .. })));
    }

    #[test]
    fn test_log_sources() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config.log_sources, vec!["/rosout"]);
        assert!(config.log_config().allows("/rosout"));
        assert!(!config.log_config().allows("/chatter"));

        let config = from_vars(&[("NODEWATCH_LOG_SOURCES", "/rosout, /diagnostics_log")]).unwrap();
        assert_eq!(config.log_sources, vec!["/rosout", "/diagnostics_log"]);

        assert!(matches!(
            from_vars(&[("NODEWATCH_LOG_SOURCES", "rosout")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            from_vars(&[("NODEWATCH_LOG_SOURCES", ",")]),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_alert_settings() {
        let config = from_vars(&[]).unwrap();
        assert!(config.alerts.enabled);
        assert!(config.alerts.error_patterns.is_empty());

        let config = from_vars(&[
            ("NODEWATCH_ALERTS_ENABLED", "false"),
            ("NODEWATCH_ALERT_COOLDOWN_SECS", "5"),
        ])
        .unwrap();
        assert!(!config.alerts.enabled);
        assert_eq!(config.alerts.cooldown(), Duration::from_secs(5));

        let path = std::env::temp_dir().join(format!("nodewatch-alerts-{}.yaml", std::process::id()));
        std::fs::write(&path, "cooldown_seconds: 15\nerror_patterns:\n  - pattern: \"failed to\"\n").unwrap();
        let config = from_vars(&[("NODEWATCH_ALERTS_FILE", path.to_str().unwrap())]).unwrap();
        assert_eq!(config.alerts.cooldown(), Duration::from_secs(15));
        assert_eq!(config.alerts.error_patterns.len(), 1);

        std::fs::write(&path, "error_patterns:\n  - pattern: \"[\"\n").unwrap();
        let err = from_vars(&[("NODEWATCH_ALERTS_FILE", path.to_str().unwrap())]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "error_patterns"));
        let _ = std::fs::remove_file(&path);

        assert!(from_vars(&[("NODEWATCH_ALERTS_FILE", "/nonexistent/alerts.yaml")]).is_err());
    }

    #[test]
    fn test_bind_addr() {
        let config = ApiConfig::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let config = ApiConfig {
            bind_host: "not an address".to_string(),
            ..ApiConfig::default()
        };
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_cache_config_carries_timeout() {
        let config = ApiConfig::default();
        let cache = config.cache_config();
        assert_eq!(cache.default_ttl, Duration::from_secs(5));
        assert_eq!(cache.fetch_timeout, Some(Duration::from_secs(30)));
    }
}

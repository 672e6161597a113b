//! Alerts
//!
//! Two background monitors turn changes in the ROS graph into alerts:
//! - node presence, read from the cached node list on the poll interval
//! - `/rosout` records matching a configured pattern, read as one more
//!   subscriber of the shared log hub
//!
//! Alerts sharing a cooldown key are raised at most once per cooldown window.
//! Raised alerts go to a broadcast channel that feeds `/ws/alerts`, and the
//! most recent ones are kept for `GET /api/v1/alerts`.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nodewatch_core::constants::ROSOUT_SOURCE;
use nodewatch_core::{ConfigError, FilterSpec, LogRecord};
use nodewatch_logs::{LogEvent, LogHub, Subscription};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{ALERT_MESSAGE_PREVIEW_CHARS, DEFAULT_ALERT_COOLDOWN_SECS, DEFAULT_ALERT_HISTORY};
use crate::inspect::NodeInspector;
use crate::telemetry::METRICS;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    NodeInactive,
    NodeRecovered,
    ErrorPattern,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::NodeInactive => "node_inactive",
            AlertType::NodeRecovered => "node_recovered",
            AlertType::ErrorPattern => "error_pattern",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// One raised alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            alert_type,
            severity,
            title: title.into(),
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// A log message pattern worth an alert. Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub pattern: String,
    #[serde(default)]
    pub severity: AlertSeverity,
}

impl ErrorPattern {
    pub fn new(pattern: impl Into<String>, severity: AlertSeverity) -> Self {
        Self {
            pattern: pattern.into(),
            severity,
        }
    }

    fn compile(&self) -> Result<Regex, ConfigError> {
        RegexBuilder::new(&self.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "error_patterns".to_string(),
                value: self.pattern.clone(),
                reason: e.to_string(),
            })
    }
}

/// Alert settings, usually read from the YAML file named by
/// `NODEWATCH_ALERTS_FILE`:
///
/// ```yaml
/// enabled: true
/// cooldown_seconds: 60
/// error_patterns:
///   - pattern: "failed to"
///     severity: error
///   - pattern: "timeout"
///     severity: warning
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub cooldown_seconds: u64,
    /// Checked in order; the first match raises the alert.
    pub error_patterns: Vec<ErrorPattern>,
    pub history_size: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_seconds: DEFAULT_ALERT_COOLDOWN_SECS,
            error_patterns: Vec::new(),
            history_size: DEFAULT_ALERT_HISTORY,
        }
    }
}

impl AlertConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::InvalidValue {
            field: "NODEWATCH_ALERTS_FILE".to_string(),
            value: "<yaml>".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
            field: "NODEWATCH_ALERTS_FILE".to_string(),
            value: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&text)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "history_size".to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        for pattern in &self.error_patterns {
            pattern.compile()?;
        }
        Ok(())
    }
}

// ============================================================================
// SERVICE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Active,
    Inactive,
}

/// Counters exposed next to the recent alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    pub enabled: bool,
    pub raised: u64,
    pub suppressed: u64,
    pub subscribers: usize,
    pub tracked_nodes: usize,
}

/// Raises, deduplicates and distributes alerts.
pub struct AlertService {
    config: AlertConfig,
    patterns: Vec<(Regex, ErrorPattern)>,
    tx: broadcast::Sender<Alert>,
    recent: Mutex<VecDeque<Alert>>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    nodes: Mutex<HashMap<String, Presence>>,
    raised: AtomicU64,
    suppressed: AtomicU64,
}

impl AlertService {
    pub fn new(config: AlertConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let patterns = config
            .error_patterns
            .iter()
            .map(|p| p.compile().map(|regex| (regex, p.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        let (tx, _) = broadcast::channel(config.history_size);

        Ok(Self {
            patterns,
            tx,
            recent: Mutex::new(VecDeque::with_capacity(config.history_size)),
            cooldowns: Mutex::new(HashMap::new()),
            nodes: Mutex::new(HashMap::new()),
            raised: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Receiver for alerts raised from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Most recent alerts, oldest first.
    pub fn recent(&self) -> Vec<Alert> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats {
            enabled: self.config.enabled,
            raised: self.raised.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            subscribers: self.tx.receiver_count(),
            tracked_nodes: self.nodes.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    /// Raise `alert` unless another alert with the same key was raised within
    /// the cooldown. Returns whether it was raised.
    pub fn raise(&self, alert: Alert, cooldown_key: &str) -> bool {
        let now = Instant::now();
        {
            let mut cooldowns = self.cooldowns.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = cooldowns.get(cooldown_key) {
                if now.duration_since(*last) < self.config.cooldown() {
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                    debug!(cooldown_key, "Alert suppressed by cooldown");
                    return false;
                }
            }
            cooldowns.insert(cooldown_key.to_string(), now);
        }

        info!(
            alert_type = alert.alert_type.as_str(),
            severity = alert.severity.as_str(),
            title = %alert.title,
            "Alert raised"
        );
        if let Ok(metrics) = METRICS.as_ref() {
            metrics.record_alert(alert.alert_type.as_str(), alert.severity.as_str());
        }
        self.raised.fetch_add(1, Ordering::Relaxed);

        {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            if recent.len() == self.config.history_size {
                recent.pop_front();
            }
            recent.push_back(alert.clone());
        }
        // No receivers is fine; the alert is still in the history.
        let _ = self.tx.send(alert);
        true
    }

    /// Compare the current node list with the previous one.
    ///
    /// A node seen for the first time is tracked silently. An active node
    /// missing from the list raises `node_inactive`; an inactive one that
    /// comes back raises `node_recovered`. Returns the number of alerts raised.
    pub fn observe_nodes(&self, current: &[String]) -> usize {
        let mut pending = Vec::new();
        {
            let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);

            for (name, presence) in nodes.iter_mut() {
                if *presence == Presence::Active && !current.contains(name) {
                    *presence = Presence::Inactive;
                    pending.push((
                        Alert::new(
                            AlertType::NodeInactive,
                            AlertSeverity::Error,
                            format!("Node went offline: {}", name),
                            format!("Node {} is no longer running", name),
                            json!({ "node_name": name }),
                        ),
                        format!("node_inactive:{}", name),
                    ));
                }
            }

            for name in current {
                match nodes.insert(name.clone(), Presence::Active) {
                    Some(Presence::Inactive) => pending.push((
                        Alert::new(
                            AlertType::NodeRecovered,
                            AlertSeverity::Info,
                            format!("Node recovered: {}", name),
                            format!("Node {} is running again", name),
                            json!({ "node_name": name }),
                        ),
                        format!("node_recovered:{}", name),
                    )),
                    Some(Presence::Active) => {}
                    None => debug!(node = %name, "Tracking node"),
                }
            }
        }

        pending
            .into_iter()
            .map(|(alert, key)| self.raise(alert, &key))
            .filter(|raised| *raised)
            .count()
    }

    /// Check one log record against the configured patterns. The first
    /// matching pattern raises the alert. Returns whether one was raised.
    pub fn check_record(&self, record: &LogRecord) -> bool {
        let Some((_, pattern)) = self
            .patterns
            .iter()
            .find(|(regex, _)| regex.is_match(&record.message))
        else {
            return false;
        };

        let alert = Alert::new(
            AlertType::ErrorPattern,
            pattern.severity,
            format!("Error pattern in {}", record.source),
            format!("[{}] {}", record.source, preview(&record.message)),
            json!({
                "node_name": record.source,
                "level": record.level,
                "pattern": pattern.pattern,
                "full_message": record.message,
            }),
        );
        self.raise(alert, &format!("error_pattern:{}:{}", pattern.pattern, record.source))
    }

    // ========================================================================
    // Monitors
    // ========================================================================

    /// Start the node and log monitors. They run until shutdown is signalled.
    pub fn spawn(
        self: &Arc<Self>,
        inspector: Arc<NodeInspector>,
        hub: Arc<LogHub>,
        node_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if !service.config.enabled {
                info!("Alerts disabled");
                return;
            }

            let logs = if service.patterns.is_empty() {
                None
            } else {
                match hub.subscribe(ROSOUT_SOURCE, &FilterSpec::match_all()) {
                    Ok(subscription) => Some(subscription),
                    Err(e) => {
                        warn!(error = %e, "Log pattern alerts unavailable");
                        None
                    }
                }
            };

            info!(
                patterns = service.patterns.len(),
                cooldown_secs = service.config.cooldown_seconds,
                "Alert monitors started"
            );
            let nodes = service.watch_nodes(&inspector, node_interval, shutdown_rx.clone());
            match logs {
                Some(subscription) => {
                    tokio::join!(nodes, service.watch_logs(subscription, shutdown_rx));
                }
                None => nodes.await,
            }
            info!("Alert monitors stopped");
        })
    }

    async fn watch_nodes(
        &self,
        inspector: &NodeInspector,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => match inspector.list_nodes(true).await {
                    Ok(listing) => {
                        let names: Vec<String> = listing.nodes.into_iter().map(|n| n.name).collect();
                        self.observe_nodes(&names);
                    }
                    // An unreachable graph says nothing about individual nodes.
                    Err(e) => debug!(error = %e.message, "Node list unavailable for alerts"),
                },
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }
    }

    async fn watch_logs(&self, mut subscription: Subscription, mut shutdown_rx: watch::Receiver<bool>) {
        // Only records logged from now on.
        subscription.take_backlog();

        loop {
            tokio::select! {
                event = subscription.next() => match event {
                    Some(LogEvent::Record(entry)) => {
                        self.check_record(&entry.record);
                    }
                    Some(LogEvent::Gap(_)) => {}
                    None => break,
                },
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }
        subscription.close();
    }
}

impl std::fmt::Debug for AlertService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertService")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

fn preview(message: &str) -> String {
    match message.char_indices().nth(ALERT_MESSAGE_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}

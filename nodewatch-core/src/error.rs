//! Error types for nodewatch operations

use std::time::Duration;
use thiserror::Error;

/// Errors produced by a collaborator fetch.
///
/// Fetch errors are `Clone` because one deduplicated fetch answers every
/// caller that was waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch for {key} timed out after {after:?}")]
    Timeout { key: String, after: Duration },

    #[error("Fetch for {key} failed: {reason}")]
    Failed { key: String, reason: String },
}

impl FetchError {
    /// Create a `Failed` error for the given key.
    pub fn failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a `Timeout` error for the given key.
    pub fn timeout(key: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            key: key.into(),
            after,
        }
    }

    /// Key of the fetch that failed.
    pub fn key(&self) -> &str {
        match self {
            Self::Timeout { key, .. } | Self::Failed { key, .. } => key,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors raised by an upstream line stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("Upstream {source_id} disconnected: {reason}")]
    UpstreamDisconnected { source_id: String, reason: String },
}

impl StreamError {
    pub fn disconnected(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamDisconnected {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while delivering records to a subscriber sink.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Subscriber {subscription_id} unresponsive, {dropped} records dropped")]
    SinkUnresponsive {
        subscription_id: String,
        dropped: u64,
    },
}

/// Filter validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("Invalid filter field {field}: {reason}")]
    InvalidFilter { field: String, reason: String },
}

impl FilterError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFilter {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised when attaching to a log source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("Log source {source_id} is not configured")]
    UnknownSource { source_id: String },

    #[error(transparent)]
    Filter(#[from] FilterError),
}

impl SubscribeError {
    pub fn unknown_source(source_id: impl Into<String>) -> Self {
        Self::UnknownSource {
            source_id: source_id.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all nodewatch errors.
#[derive(Debug, Clone, Error)]
pub enum NodewatchError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Subscribe error: {0}")]
    Subscribe(#[from] SubscribeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for nodewatch operations.
pub type NodewatchResult<T> = Result<T, NodewatchError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = FetchError::timeout("node_list:all", Duration::from_secs(30));
        let msg = err.to_string();
        assert!(msg.contains("node_list:all"));
        assert!(msg.contains("timed out"));
        assert!(err.is_timeout());

        let err = FetchError::failed("node_info:/talker", "exit status 1");
        assert_eq!(err.key(), "node_info:/talker");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_errors_convert_into_master_error() {
        let err: NodewatchError = FilterError::invalid("patterns", "empty pattern").into();
        assert!(matches!(err, NodewatchError::Filter(_)));
        assert!(err.to_string().contains("empty pattern"));

        let err: NodewatchError = StreamError::disconnected("/rosout", "eof").into();
        assert!(matches!(err, NodewatchError::Stream(_)));
    }

    #[test]
    fn test_subscribe_error_wraps_filter_error() {
        let err: SubscribeError = FilterError::invalid("min_level", "unknown level").into();
        assert!(err.to_string().contains("unknown level"));

        let err = SubscribeError::unknown_source("/chatter");
        assert_eq!(err.to_string(), "Log source /chatter is not configured");
    }

    #[test]
    fn test_sink_unresponsive_display() {
        let err = DeliveryError::SinkUnresponsive {
            subscription_id: "abc".to_string(),
            dropped: 7,
        };
        assert_eq!(err.to_string(), "Subscriber abc unresponsive, 7 records dropped");
    }
}

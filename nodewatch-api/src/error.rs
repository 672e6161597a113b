//! Error Types for the nodewatch API
//!
//! This module defines error handling for the API layer, including:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//!
//! All errors are serialized as JSON with appropriate HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use nodewatch_core::{ConfigError, FetchError, FilterError, SubscribeError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each error code maps to a specific HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request contains invalid input data
    InvalidInput,

    /// Required field is missing from request
    MissingField,

    /// Field format is incorrect
    InvalidFormat,

    /// Log filter was rejected
    InvalidFilter,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// Requested node is not in the current node list
    NodeNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Operation conflicts with the node's current state
    StateConflict,

    // ========================================================================
    // Upstream Errors (502, 504)
    // ========================================================================
    /// Inspection command failed
    FetchFailed,

    /// Inspection command did not finish in time
    FetchTimeout,

    // ========================================================================
    // Server Errors (500, 503)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// Service is temporarily unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput
            | ErrorCode::MissingField
            | ErrorCode::InvalidFormat
            | ErrorCode::InvalidFilter => StatusCode::BAD_REQUEST,

            ErrorCode::NodeNotFound => StatusCode::NOT_FOUND,

            ErrorCode::StateConflict => StatusCode::CONFLICT,

            ErrorCode::FetchFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::FetchTimeout => StatusCode::GATEWAY_TIMEOUT,

            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::InvalidFormat => "Invalid format",
            ErrorCode::InvalidFilter => "Invalid log filter",
            ErrorCode::NodeNotFound => "Node not found",
            ErrorCode::StateConflict => "Operation conflicts with current state",
            ErrorCode::FetchFailed => "Inspection command failed",
            ErrorCode::FetchTimeout => "Inspection command timed out",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
///
/// Returned by every endpoint on failure, and sent as the `message` of a
/// WebSocket `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
    }

    pub fn invalid_format(field: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidFormat,
            format!("Field '{}' has invalid format, expected {}", field, expected),
        )
    }

    pub fn node_not_found(name: &str) -> Self {
        Self::new(ErrorCode::NodeNotFound, format!("Node '{}' not found", name))
    }

    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StateConflict, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

/// Lets handlers return `ApiResult<T>` directly.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

// ============================================================================
// CONVERSIONS FROM CORE ERRORS
// ============================================================================

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        tracing::warn!(key = %err.key(), error = %err, "Inspection fetch failed");
        let code = if err.is_timeout() {
            ErrorCode::FetchTimeout
        } else {
            ErrorCode::FetchFailed
        };
        ApiError::new(code, err.to_string()).with_details(serde_json::json!({ "key": err.key() }))
    }
}

impl From<FilterError> for ApiError {
    fn from(err: FilterError) -> Self {
        let FilterError::InvalidFilter { field, reason } = &err;
        ApiError::new(ErrorCode::InvalidFilter, err.to_string())
            .with_details(serde_json::json!({ "field": field, "reason": reason }))
    }
}

impl From<SubscribeError> for ApiError {
    fn from(err: SubscribeError) -> Self {
        match err {
            SubscribeError::Filter(err) => err.into(),
            SubscribeError::UnknownSource { ref source_id } => {
                ApiError::invalid_input(err.to_string())
                    .with_details(serde_json::json!({ "source": source_id }))
            }
        }
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::internal_error(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        tracing::error!("JSON serialization error: {:?}", err);
        ApiError::invalid_input(format!("Invalid JSON: {}", err))
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(ErrorCode::InvalidFilter.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::NodeNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::StateConflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::FetchFailed.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorCode::FetchTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_subscribe_error_conversion() {
        let err: ApiError = SubscribeError::unknown_source("/chatter").into();
        assert_eq!(err.code, ErrorCode::InvalidInput);
        assert_eq!(err.details, Some(serde_json::json!({ "source": "/chatter" })));

        let err: ApiError = SubscribeError::from(FilterError::invalid("patterns", "empty")).into();
        assert_eq!(err.code, ErrorCode::InvalidFilter);
    }

    #[test]
    fn test_fetch_error_conversion() {
        let err: ApiError = FetchError::timeout("node_list:all", Duration::from_secs(30)).into();
        assert_eq!(err.code, ErrorCode::FetchTimeout);
        assert_eq!(err.details, Some(serde_json::json!({ "key": "node_list:all" })));

        let err: ApiError = FetchError::failed("node_info:/a", "exit status 1").into();
        assert_eq!(err.code, ErrorCode::FetchFailed);
        assert!(err.message.contains("exit status 1"));
    }

    #[test]
    fn test_filter_error_conversion() {
        let err: ApiError = FilterError::invalid("min_level", "unknown level LOUD").into();
        assert_eq!(err.code, ErrorCode::InvalidFilter);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            err.details,
            Some(serde_json::json!({ "field": "min_level", "reason": "unknown level LOUD" }))
        );
    }

    #[test]
    fn test_error_serialization() -> Result<(), serde_json::Error> {
        let err = ApiError::node_not_found("/planning/planner");
        let json = serde_json::to_string(&err)?;

        assert!(json.contains("NODE_NOT_FOUND"));
        assert!(json.contains("/planning/planner"));
        assert!(!json.contains("details"));

        let deserialized: ApiError = serde_json::from_str(&json)?;
        assert_eq!(deserialized, err);
        Ok(())
    }

    #[test]
    fn test_error_display() {
        let err = ApiError::from_code(ErrorCode::ServiceUnavailable);
        let display = format!("{}", err);
        assert!(display.contains("ServiceUnavailable"));
        assert!(display.contains("temporarily unavailable"));
    }
}

//! Tracing Subscriber Initialization
//!
//! JSON lines to stdout by default, filtered by `RUST_LOG`. A human-readable
//! format is available for local runs.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ApiError, ApiResult};

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "nodewatch_api=debug,nodewatch_cache=info,nodewatch_logs=info,tower_http=debug,info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Environment (production, staging, development)
    pub environment: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: std::env::var("NODEWATCH_SERVICE_NAME")
                .unwrap_or_else(|_| "nodewatch-api".to_string()),
            environment: std::env::var("NODEWATCH_ENVIRONMENT")
                .unwrap_or_else(|_| "development".to_string()),
            format: match std::env::var("NODEWATCH_LOG_FORMAT").as_deref() {
                Ok("text") | Ok("pretty") => LogFormat::Text,
                _ => LogFormat::Json,
            },
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Call once at startup before anything logs. A second call fails.
pub fn init_tracer(config: &TelemetryConfig) -> ApiResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| ApiError::internal_error(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = %config.service_name,
        environment = %config.environment,
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig {
            service_name: "nodewatch-test".to_string(),
            environment: "test".to_string(),
            format: LogFormat::Text,
        };
        // Whichever test initializes first wins; after that every call errors.
        let _ = init_tracer(&config);
        assert!(init_tracer(&config).is_err());
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}

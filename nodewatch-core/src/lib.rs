//! Nodewatch Core - Shared Types
//!
//! Log records, severities, subscription filters and the error taxonomy used
//! by the cache, the log pipeline and the API layer.

pub mod constants;
pub mod error;
pub mod filter;
pub mod log;

pub use error::{
    ConfigError, DeliveryError, FetchError, FilterError, NodewatchError, NodewatchResult,
    StreamError, SubscribeError,
};
pub use filter::{FilterSpec, LogFilter, NamePattern};
pub use log::{LogLevel, LogRecord};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

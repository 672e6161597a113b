//! Nodewatch API - HTTP/WebSocket layer
//!
//! Exposes the ROS2 graph running inside a Docker container: cached node
//! inspection over REST, live `/rosout` logs, node status and alerts over
//! WebSocket.
//!
//! Every ROS2 query goes through `docker exec`. Results are held in a TTL
//! cache so that many dashboard clients cost one command per key per TTL,
//! and one ingestion pump per log source feeds every log subscriber.

#[macro_use]
pub mod macros;

pub mod alerts;
pub mod config;
pub mod constants;
pub mod error;
pub mod inspect;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use alerts::{Alert, AlertConfig, AlertService, AlertSeverity, AlertType};
pub use config::ApiConfig;
pub use error::{ApiError, ApiResult, ErrorCode};
pub use inspect::{NodeInspector, NodeKind};
pub use routes::create_api_router;
pub use state::{AppState, InspectionCache, InspectionScheduler};
pub use transport::{CommandTransport, DockerExecTransport, TopicEchoSource, TransportError};
pub use ws::WsState;

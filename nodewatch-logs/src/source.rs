//! Upstream line stream collaborator.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use nodewatch_core::StreamError;

/// Continuous stream of raw lines from one log source.
///
/// The stream ending or yielding an error both mean the upstream is gone.
pub type LineStream = BoxStream<'static, Result<String, StreamError>>;

/// Opens line streams for log sources.
#[async_trait]
pub trait LineSource: Send + Sync {
    async fn open(&self, source_id: &str) -> Result<LineStream, StreamError>;
}

//! Nodewatch Test Utilities
//!
//! Shared test infrastructure for the nodewatch workspace:
//! - Scripted collaborators (fetchers and line sources) with call counters
//! - Proptest generators for records and filters
//! - Fixtures for rosout output and common records

pub use nodewatch_core::{FetchError, FilterSpec, LogLevel, LogRecord, StreamError};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::stream::{self, StreamExt};
use nodewatch_cache::Fetcher;
use nodewatch_logs::{LineSource, LineStream};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// SCRIPTED FETCHER
// ============================================================================

/// Fetcher that replays scripted outcomes after an optional delay.
///
/// Outcomes are consumed in order; once the script runs out the fallback is
/// returned forever.
pub struct ScriptedFetcher<V> {
    script: Mutex<VecDeque<Result<V, FetchError>>>,
    fallback: Result<V, FetchError>,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl<V: Clone + Send + Sync + 'static> ScriptedFetcher<V> {
    /// Always succeed with `value`.
    pub fn ok(value: V) -> Self {
        Self::with_fallback(Ok(value))
    }

    /// Always fail with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self::with_fallback(Err(FetchError::failed("scripted", reason)))
    }

    pub fn with_fallback(fallback: Result<V, FetchError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Sleep this long (on the Tokio clock) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue outcomes returned before the fallback.
    pub fn then(self, outcome: Result<V, FetchError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
        self
    }

    /// Number of fetches started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most fetches ever running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn answer(&self, key: &str) -> Result<V, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next.unwrap_or_else(|| self.fallback.clone()) {
            Ok(value) => Ok(value),
            Err(FetchError::Failed { reason, .. }) => Err(FetchError::failed(key, reason)),
            Err(other) => Err(other),
        }
    }

    /// Closure for [`TtlCache::get_or_fetch`](nodewatch_cache::TtlCache::get_or_fetch)
    /// that calls this fetcher for `key`.
    #[allow(clippy::type_complexity)]
    pub fn fetch_fn(
        self: &Arc<Self>,
        key: &str,
    ) -> impl FnOnce() -> Pin<Box<dyn Future<Output = Result<V, FetchError>> + Send>> + Send + 'static
    {
        let fetcher = Arc::clone(self);
        let key = key.to_string();
        move || Box::pin(async move { fetcher.answer(&key).await })
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> Fetcher<V> for ScriptedFetcher<V> {
    async fn fetch(&self, key: &str) -> Result<V, FetchError> {
        self.answer(key).await
    }
}

// ============================================================================
// SCRIPTED LINE SOURCE
// ============================================================================

/// What one `open` call on a [`ScriptedLineSource`] produces.
pub enum ScriptedConnection {
    /// `open` fails.
    Refused(String),
    /// Yields the lines, then ends cleanly.
    Lines(Vec<String>),
    /// Yields the lines, then fails.
    LinesThenError(Vec<String>, String),
    /// Lines pushed through a [`LiveFeed`]; dropping the feed ends the stream.
    Live(mpsc::UnboundedReceiver<Result<String, StreamError>>),
}

impl ScriptedConnection {
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Lines(lines.into_iter().map(Into::into).collect())
    }

    /// A connection fed by the returned handle.
    pub fn live() -> (Self, LiveFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::Live(rx), LiveFeed { tx })
    }
}

/// Push side of a [`ScriptedConnection::Live`] stream.
#[derive(Clone)]
pub struct LiveFeed {
    tx: mpsc::UnboundedSender<Result<String, StreamError>>,
}

impl LiveFeed {
    pub fn send(&self, line: impl Into<String>) -> bool {
        self.tx.send(Ok(line.into())).is_ok()
    }

    pub fn send_all<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for line in lines {
            self.send(line);
        }
    }

    /// Fail the stream.
    pub fn fail(&self, source_id: &str, reason: &str) -> bool {
        self.tx
            .send(Err(StreamError::disconnected(source_id, reason)))
            .is_ok()
    }
}

/// Line source replaying scripted connections in order.
///
/// Once the script is exhausted, `open` returns a stream that never yields,
/// so a pump under test settles instead of reconnecting forever.
#[derive(Default)]
pub struct ScriptedLineSource {
    script: Mutex<VecDeque<ScriptedConnection>>,
    opens: AtomicUsize,
}

impl ScriptedLineSource {
    pub fn new<I>(connections: I) -> Self
    where
        I: IntoIterator<Item = ScriptedConnection>,
    {
        Self {
            script: Mutex::new(connections.into_iter().collect()),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, connection: ScriptedConnection) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(connection);
    }

    /// Number of `open` calls so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LineSource for ScriptedLineSource {
    async fn open(&self, source_id: &str) -> Result<LineStream, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match next {
            None => Ok(stream::pending::<Result<String, StreamError>>().boxed()),
            Some(ScriptedConnection::Refused(reason)) => {
                Err(StreamError::disconnected(source_id, reason))
            }
            Some(ScriptedConnection::Lines(lines)) => {
                Ok(stream::iter(lines.into_iter().map(Ok)).boxed())
            }
            Some(ScriptedConnection::LinesThenError(lines, reason)) => {
                let failure = StreamError::disconnected(source_id, reason);
                Ok(stream::iter(lines.into_iter().map(Ok))
                    .chain(stream::once(async move { Err(failure) }))
                    .boxed())
            }
            Some(ScriptedConnection::Live(rx)) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for nodewatch types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_log_level() -> impl Strategy<Value = LogLevel> {
        prop::sample::select(LogLevel::ALL.to_vec())
    }

    /// Hierarchical source path with one to four segments.
    pub fn arb_source_path() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z][a-z0-9_]{0,7}", 1..=4)
            .prop_map(|segments| format!("/{}", segments.join("/")))
    }

    pub fn arb_log_record() -> impl Strategy<Value = LogRecord> {
        (
            0i64..2_000_000_000,
            arb_log_level(),
            arb_source_path(),
            "[ -~]{0,40}",
        )
            .prop_map(|(secs, level, source, message)| {
                let timestamp = Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now);
                LogRecord::new(timestamp, level, source, message)
            })
    }

    /// Valid filter specs: prefix patterns and an optional level floor.
    pub fn arb_filter_spec() -> impl Strategy<Value = FilterSpec> {
        (
            prop::collection::vec(arb_source_path(), 0..3),
            prop::option::of(arb_log_level()),
        )
            .prop_map(|(patterns, level)| FilterSpec::new(patterns, level))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built records and upstream output for common scenarios.

    use super::*;

    /// Record stamped now.
    pub fn record(source: &str, level: LogLevel, message: &str) -> LogRecord {
        LogRecord::new(Utc::now(), level, source, message)
    }

    /// Lines of one `ros2 topic echo /rosout` block, terminator included.
    ///
    /// `name` is a logger name such as `sensing.lidar`.
    pub fn rosout_block(sec: i64, level_code: u8, name: &str, msg: &str) -> Vec<String> {
        vec![
            "stamp:".to_string(),
            format!("  sec: {}", sec),
            "  nanosec: 0".to_string(),
            format!("level: {}", level_code),
            format!("name: {}", name),
            format!("msg: '{}'", msg),
            "file: /opt/ws/src/node.cpp".to_string(),
            "function: on_timer".to_string(),
            "line: 42".to_string(),
            "---".to_string(),
        ]
    }

    /// Blocks for several `(name, message)` pairs at INFO, concatenated.
    pub fn rosout_lines(entries: &[(&str, &str)]) -> Vec<String> {
        entries
            .iter()
            .enumerate()
            .flat_map(|(i, (name, msg))| rosout_block(1_714_564_800 + i as i64, 20, name, msg))
            .collect()
    }

    /// One JSON line per record, for [`JsonLineDecoder`](nodewatch_logs::JsonLineDecoder).
    pub fn json_lines(records: &[LogRecord]) -> Vec<String> {
        records
            .iter()
            .filter_map(|record| serde_json::to_string(record).ok())
            .collect()
    }
}

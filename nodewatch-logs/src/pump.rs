//! Ingestion Pump
//!
//! One long-lived task per log source. It opens the upstream line stream,
//! decodes lines into records and, for each record in order, appends it to the
//! ring buffer and then publishes it to the fan-out engine.
//!
//! When the stream ends or fails the pump backs off exponentially (capped)
//! and reconnects. The pump enters `Streaming` on the first line of a
//! connection. Leaving `Streaming` emits exactly one gap notice for the
//! disconnect episode and resets the backoff; failed reconnect attempts within
//! the same episode, including streams that end without output, emit nothing
//! more and keep growing the delay.

use crate::decode::RecordDecoder;
use crate::event::GapNotice;
use crate::fanout::FanoutEngine;
use crate::ring::RingBuffer;
use crate::source::{LineSource, LineStream};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Reconnect backoff for the ingestion pump.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure (default: 1000ms).
    pub initial_ms: u64,
    /// Upper bound on the delay (default: 30000ms).
    pub max_ms: u64,
    /// Growth factor per consecutive failure (default: 2.0).
    pub multiplier: f64,
    /// Random extra delay in `[0, jitter_ms)` (default: 250ms).
    pub jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

impl BackoffConfig {
    /// Fixed delay without growth or jitter.
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_ms: ms,
            max_ms: ms,
            multiplier: 1.0,
            jitter_ms: 0,
        }
    }

    pub fn with_initial(mut self, delay: Duration) -> Self {
        self.initial_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max(mut self, delay: Duration) -> Self {
        self.max_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter_ms = jitter.as_millis() as u64;
        self
    }

    /// Delay following `current_ms`, capped at `max_ms`.
    pub fn next_ms(&self, current_ms: u64) -> u64 {
        let next = (current_ms as f64 * self.multiplier.max(1.0)) as u64;
        next.min(self.max_ms).max(self.initial_ms.min(self.max_ms))
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    base_ms.saturating_add(nanos % jitter_ms)
}

// ============================================================================
// STATE & STATS
// ============================================================================

/// Connection state of a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpState {
    Disconnected,
    Connecting,
    Streaming,
}

#[derive(Debug, Default)]
struct PumpCounters {
    records: AtomicU64,
    undecodable: AtomicU64,
    connect_attempts: AtomicU64,
    gaps: AtomicU64,
}

/// Snapshot of a pump's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpStats {
    pub state: PumpState,
    pub records: u64,
    pub undecodable: u64,
    pub connect_attempts: u64,
    pub gaps: u64,
}

/// Observer for a running pump.
#[derive(Clone)]
pub struct PumpHandle {
    state_rx: watch::Receiver<PumpState>,
    counters: Arc<PumpCounters>,
}

impl PumpHandle {
    pub fn state(&self) -> PumpState {
        *self.state_rx.borrow()
    }

    /// Receiver for state transitions.
    pub fn watch_state(&self) -> watch::Receiver<PumpState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> PumpStats {
        PumpStats {
            state: self.state(),
            records: self.counters.records.load(Ordering::Relaxed),
            undecodable: self.counters.undecodable.load(Ordering::Relaxed),
            connect_attempts: self.counters.connect_attempts.load(Ordering::Relaxed),
            gaps: self.counters.gaps.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// PUMP
// ============================================================================

/// Reads one upstream source into a ring buffer and fan-out engine.
pub struct IngestionPump {
    source_id: String,
    source: Arc<dyn LineSource>,
    decoder: Box<dyn RecordDecoder>,
    ring: Arc<RingBuffer>,
    fanout: Arc<FanoutEngine>,
    backoff: BackoffConfig,
    state_tx: watch::Sender<PumpState>,
    counters: Arc<PumpCounters>,
}

impl IngestionPump {
    pub fn new(
        source_id: impl Into<String>,
        source: Arc<dyn LineSource>,
        decoder: Box<dyn RecordDecoder>,
        fanout: Arc<FanoutEngine>,
        backoff: BackoffConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(PumpState::Disconnected);
        Self {
            source_id: source_id.into(),
            source,
            decoder,
            ring: Arc::clone(fanout.ring()),
            fanout,
            backoff,
            state_tx,
            counters: Arc::new(PumpCounters::default()),
        }
    }

    pub fn handle(&self) -> PumpHandle {
        PumpHandle {
            state_rx: self.state_tx.subscribe(),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Run until shutdown is signalled or the shutdown sender is dropped.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff_ms = self.backoff.initial_ms;
        tracing::info!(source_id = %self.source_id, "Ingestion pump started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.set_state(PumpState::Connecting);
            self.counters.connect_attempts.fetch_add(1, Ordering::Relaxed);

            let opened = tokio::select! {
                opened = self.source.open(&self.source_id) => opened,
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            };

            match opened {
                Ok(stream) => {
                    self.decoder.reset();
                    let end = self.stream_records(stream, &mut shutdown_rx).await;
                    let (reason, streamed) = match end {
                        StreamEnd::Lost { reason, streamed } => (reason, streamed),
                        StreamEnd::Shutdown => break,
                    };

                    self.set_state(PumpState::Disconnected);
                    self.decoder.reset();
                    if streamed {
                        backoff_ms = self.backoff.initial_ms;
                        let notice = GapNotice::new(&self.source_id, self.ring.last_seq(), &reason);
                        self.fanout.publish_gap(&notice);
                        self.counters.gaps.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            source_id = %self.source_id,
                            reason = %reason,
                            last_seq = notice.last_seq,
                            "Upstream stream lost"
                        );
                    } else {
                        tracing::warn!(
                            source_id = %self.source_id,
                            reason = %reason,
                            retry_ms = backoff_ms,
                            "Upstream stream ended before any output"
                        );
                    }
                }
                Err(err) => {
                    self.set_state(PumpState::Disconnected);
                    tracing::warn!(
                        source_id = %self.source_id,
                        error = %err,
                        retry_ms = backoff_ms,
                        "Failed to open upstream stream"
                    );
                }
            }

            let delay = jittered_backoff(backoff_ms, self.backoff.jitter_ms);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
            backoff_ms = self.backoff.next_ms(backoff_ms);
        }

        self.set_state(PumpState::Disconnected);
        tracing::info!(source_id = %self.source_id, "Ingestion pump stopped");
    }

    /// Ingest until the stream ends or shutdown is requested.
    ///
    /// The pump only counts as `Streaming` once the first line arrives; a
    /// process that starts and exits silently is a failed connect.
    async fn stream_records(
        &mut self,
        mut stream: LineStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        let mut streamed = false;
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = wait_for_shutdown(shutdown_rx) => return StreamEnd::Shutdown,
            };
            let reason = match next {
                Some(Ok(line)) => {
                    if !streamed {
                        streamed = true;
                        self.set_state(PumpState::Streaming);
                        tracing::info!(source_id = %self.source_id, "Upstream stream opened");
                    }
                    self.ingest_line(&line);
                    continue;
                }
                Some(Err(err)) => err.to_string(),
                None => "upstream stream ended".to_string(),
            };
            return StreamEnd::Lost { reason, streamed };
        }
    }

    fn ingest_line(&mut self, line: &str) {
        match self.decoder.push_line(line) {
            Some(Ok(record)) => {
                let entry = self.ring.append(record);
                self.fanout.publish(&entry);
                self.counters.records.fetch_add(1, Ordering::Relaxed);
            }
            Some(Err(err)) => {
                self.counters.undecodable.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(source_id = %self.source_id, error = %err, "Skipping log block");
            }
            None => {}
        }
    }

    fn set_state(&self, state: PumpState) {
        self.state_tx.send_replace(state);
    }
}

/// How a stream ended.
enum StreamEnd {
    Shutdown,
    Lost { reason: String, streamed: bool },
}

/// Resolves once shutdown is requested or the sender is gone.
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

//! Per-source log channels.
//!
//! The hub owns one ring buffer, fan-out engine and ingestion pump per log
//! source and starts the pump the first time the source is used, so every
//! source has exactly one upstream stream no matter how many clients
//! subscribe.
//!
//! Only sources named in [`LogConfig::sources`] can be opened. A channel lives
//! as long as the hub, so the allow-list bounds the number of pumps and
//! upstream processes.

use crate::decode::{DecoderFactory, RecordDecoder, RosoutDecoder};
use crate::fanout::{FanoutConfig, FanoutEngine, FanoutStats, Subscription};
use crate::pump::{BackoffConfig, IngestionPump, PumpHandle, PumpStats};
use crate::ring::RingBuffer;
use crate::source::LineSource;
use dashmap::DashMap;
use nodewatch_core::constants::{
    DEFAULT_REPLAY_SIZE, DEFAULT_RING_CAPACITY, DEFAULT_SUBSCRIBER_QUEUE, ROSOUT_SOURCE,
};
use nodewatch_core::{FilterSpec, SubscribeError};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Log pipeline configuration shared by every source.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Records kept per source (default: 1000).
    pub ring_capacity: usize,
    /// Backlog records replayed to a new subscriber (default: 100).
    pub replay_size: usize,
    /// Per-subscription queue depth (default: 256).
    pub subscriber_queue: usize,
    pub backoff: BackoffConfig,
    /// Sources clients may subscribe to (default: `/rosout`).
    pub sources: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            replay_size: DEFAULT_REPLAY_SIZE,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            backoff: BackoffConfig::default(),
            sources: vec![ROSOUT_SOURCE.to_string()],
        }
    }
}

impl LogConfig {
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub fn with_replay_size(mut self, replay_size: usize) -> Self {
        self.replay_size = replay_size;
        self
    }

    pub fn with_subscriber_queue(mut self, depth: usize) -> Self {
        self.subscriber_queue = depth;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn allows(&self, source_id: &str) -> bool {
        self.sources.iter().any(|s| s == source_id)
    }

    fn fanout(&self) -> FanoutConfig {
        FanoutConfig::default()
            .with_replay_size(self.replay_size)
            .with_queue_capacity(self.subscriber_queue)
    }
}

// ============================================================================
// CHANNELS
// ============================================================================

/// Ring, fan-out engine and pump for one source.
pub struct LogChannel {
    source_id: String,
    fanout: Arc<FanoutEngine>,
    pump: PumpHandle,
}

impl LogChannel {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn fanout(&self) -> &Arc<FanoutEngine> {
        &self.fanout
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        self.fanout.ring()
    }

    pub fn pump(&self) -> &PumpHandle {
        &self.pump
    }

    pub fn subscribe(&self, spec: &FilterSpec) -> Result<Subscription, SubscribeError> {
        Ok(self.fanout.subscribe(spec)?)
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            source_id: self.source_id.clone(),
            buffered: self.ring().len(),
            last_seq: self.ring().last_seq(),
            pump: self.pump.stats(),
            fanout: self.fanout.stats(),
        }
    }
}

/// Snapshot of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub source_id: String,
    pub buffered: usize,
    pub last_seq: u64,
    pub pump: PumpStats,
    pub fanout: FanoutStats,
}

/// Registry of log channels keyed by source id.
pub struct LogHub {
    config: LogConfig,
    source: Arc<dyn LineSource>,
    decoders: DecoderFactory,
    channels: DashMap<String, Arc<LogChannel>>,
    shutdown_tx: watch::Sender<bool>,
}

impl LogHub {
    /// Hub decoding `ros2 topic echo /rosout` output.
    pub fn new(config: LogConfig, source: Arc<dyn LineSource>) -> Self {
        Self::with_decoder(
            config,
            source,
            Arc::new(|| Box::new(RosoutDecoder::new()) as Box<dyn RecordDecoder>),
        )
    }

    pub fn with_decoder(
        config: LogConfig,
        source: Arc<dyn LineSource>,
        decoders: DecoderFactory,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            source,
            decoders,
            channels: DashMap::new(),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Reject sources outside the configured allow-list.
    pub fn check_source(&self, source_id: &str) -> Result<(), SubscribeError> {
        if self.config.allows(source_id) {
            Ok(())
        } else {
            Err(SubscribeError::unknown_source(source_id))
        }
    }

    /// Shared channel for `source_id`, started on first use.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn channel(&self, source_id: &str) -> Result<Arc<LogChannel>, SubscribeError> {
        if let Some(channel) = self.channels.get(source_id) {
            return Ok(Arc::clone(channel.value()));
        }
        self.check_source(source_id)?;

        let channel = self
            .channels
            .entry(source_id.to_string())
            .or_insert_with(|| self.start_channel(source_id));
        Ok(Arc::clone(channel.value()))
    }

    /// Subscribe to `source_id`, starting its pump if needed.
    pub fn subscribe(
        &self,
        source_id: &str,
        spec: &FilterSpec,
    ) -> Result<Subscription, SubscribeError> {
        // Validate the filter before a pump is started for it.
        spec.compile()?;
        self.channel(source_id)?.subscribe(spec)
    }

    /// Channel for `source_id` if it was started.
    pub fn get(&self, source_id: &str) -> Option<Arc<LogChannel>> {
        self.channels.get(source_id).map(|c| Arc::clone(c.value()))
    }

    pub fn statuses(&self) -> Vec<ChannelStatus> {
        let mut statuses: Vec<_> = self.channels.iter().map(|c| c.status()).collect();
        statuses.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        statuses
    }

    /// Stop every pump. Existing subscriptions stay open but receive nothing
    /// further.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn start_channel(&self, source_id: &str) -> Arc<LogChannel> {
        let ring = Arc::new(RingBuffer::new(self.config.ring_capacity));
        let fanout = FanoutEngine::new(ring, self.config.fanout());
        let pump = IngestionPump::new(
            source_id,
            Arc::clone(&self.source),
            (self.decoders)(),
            Arc::clone(&fanout),
            self.config.backoff.clone(),
        );
        let handle = pump.handle();
        tokio::spawn(pump.run(self.shutdown_tx.subscribe()));

        tracing::info!(source_id = %source_id, "Log channel started");
        Arc::new(LogChannel {
            source_id: source_id.to_string(),
            fanout,
            pump: handle,
        })
    }
}

impl Drop for LogHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Subscriber registry and fan-out engine.
//!
//! Each subscription owns a bounded queue. Publishing never waits on a
//! subscriber: when a queue is full the record is dropped for that
//! subscription alone and its `dropped` counter goes up. A subscription whose
//! receiving side is gone is removed on the next publish.
//!
//! New subscriptions get a backlog from the ring buffer before any live
//! record. The subscription is registered before the backlog snapshot is
//! taken, and live records already covered by the snapshot are skipped by
//! sequence number, so nothing is lost or delivered twice.

use crate::event::{GapNotice, LogEvent};
use crate::ring::{RingBuffer, SequencedRecord};
use nodewatch_core::constants::{DEFAULT_REPLAY_SIZE, DEFAULT_SUBSCRIBER_QUEUE};
use nodewatch_core::{DeliveryError, FilterError, FilterSpec, LogFilter};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use uuid::Uuid;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for a [`FanoutEngine`].
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Maximum backlog records handed to a new subscription.
    pub replay_size: usize,
    /// Queue depth per subscription before records are dropped.
    pub queue_capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            replay_size: DEFAULT_REPLAY_SIZE,
            queue_capacity: DEFAULT_SUBSCRIBER_QUEUE,
        }
    }
}

impl FanoutConfig {
    pub fn with_replay_size(mut self, replay_size: usize) -> Self {
        self.replay_size = replay_size;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }
}

// ============================================================================
// ENGINE
// ============================================================================

struct Slot {
    filter: RwLock<LogFilter>,
    tx: mpsc::Sender<LogEvent>,
    dropped: AtomicU64,
}

impl Slot {
    fn matches(&self, entry: &SequencedRecord) -> bool {
        self.filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matches(&entry.record)
    }
}

/// Delivery statistics for one engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FanoutStats {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub gaps: u64,
}

#[derive(Debug, Default)]
struct FanoutCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    gaps: AtomicU64,
}

enum Delivery {
    Sent,
    Dropped,
    Closed,
}

/// Distributes records from one source to its subscriptions.
pub struct FanoutEngine {
    ring: Arc<RingBuffer>,
    config: FanoutConfig,
    slots: RwLock<HashMap<Uuid, Arc<Slot>>>,
    counters: FanoutCounters,
}

impl FanoutEngine {
    pub fn new(ring: Arc<RingBuffer>, config: FanoutConfig) -> Arc<Self> {
        Arc::new(Self {
            ring,
            config,
            slots: RwLock::new(HashMap::new()),
            counters: FanoutCounters::default(),
        })
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Register a subscription and hand back its backlog.
    ///
    /// The backlog is the ring's content filtered by `spec`, capped at the
    /// most recent `replay_size` matches. Invalid filters are rejected before
    /// anything is registered.
    pub fn subscribe(self: &Arc<Self>, spec: &FilterSpec) -> Result<Subscription, FilterError> {
        let filter = spec.compile()?;
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let id = Uuid::now_v7();
        let slot = Arc::new(Slot {
            filter: RwLock::new(filter.clone()),
            tx,
            dropped: AtomicU64::new(0),
        });

        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&slot));

        let snapshot = self.ring.snapshot(usize::MAX);
        let covered_seq = snapshot.last().map(|entry| entry.seq).unwrap_or(0);
        let mut backlog: Vec<SequencedRecord> = snapshot
            .into_iter()
            .filter(|entry| filter.matches(&entry.record))
            .collect();
        let excess = backlog.len().saturating_sub(self.config.replay_size);
        backlog.drain(..excess);

        tracing::debug!(
            subscription_id = %id,
            backlog = backlog.len(),
            covered_seq,
            "Subscription registered"
        );

        Ok(Subscription {
            id,
            engine: Arc::clone(self),
            slot,
            rx,
            backlog,
            covered_seq,
            closed: false,
        })
    }

    /// Validate `spec` and atomically replace the subscription's filter.
    ///
    /// Returns `Ok(false)` if the subscription no longer exists. The backlog is
    /// not redelivered.
    pub fn update_filter(&self, id: Uuid, spec: &FilterSpec) -> Result<bool, FilterError> {
        let filter = spec.compile()?;
        let slot = match self.slot(id) {
            Some(slot) => slot,
            None => return Ok(false),
        };
        *slot.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
        tracing::debug!(subscription_id = %id, "Subscription filter updated");
        Ok(true)
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            tracing::debug!(subscription_id = %id, "Subscription removed");
        }
        removed
    }

    /// Deliver a record to every subscription whose filter matches it.
    ///
    /// Returns the number of subscriptions the record was queued for.
    pub fn publish(&self, entry: &SequencedRecord) -> usize {
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, slot) in self.snapshot_slots() {
            if !slot.matches(entry) {
                continue;
            }
            match self.deliver(id, &slot, LogEvent::Record(entry.clone())) {
                Delivery::Sent => delivered += 1,
                Delivery::Dropped => {}
                Delivery::Closed => closed.push(id),
            }
        }

        self.remove_closed(closed);
        delivered
    }

    /// Deliver a gap notice to every subscription, regardless of filter.
    pub fn publish_gap(&self, notice: &GapNotice) -> usize {
        self.counters.gaps.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, slot) in self.snapshot_slots() {
            match self.deliver(id, &slot, LogEvent::Gap(notice.clone())) {
                Delivery::Sent => delivered += 1,
                Delivery::Dropped => {}
                Delivery::Closed => closed.push(id),
            }
        }

        self.remove_closed(closed);
        tracing::info!(
            source_id = %notice.source_id,
            last_seq = notice.last_seq,
            subscribers = delivered,
            "Gap notice published"
        );
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Records dropped for one subscription, if it still exists.
    pub fn dropped(&self, id: Uuid) -> Option<u64> {
        self.slot(id).map(|slot| slot.dropped.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            subscribers: self.subscriber_count(),
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            gaps: self.counters.gaps.load(Ordering::Relaxed),
        }
    }

    fn slot(&self, id: Uuid) -> Option<Arc<Slot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Copy the subscriber list so delivery happens outside the lock.
    fn snapshot_slots(&self) -> Vec<(Uuid, Arc<Slot>)> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect()
    }

    fn deliver(&self, id: Uuid, slot: &Slot, event: LogEvent) -> Delivery {
        match slot.tx.try_send(event) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => {
                let dropped = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                if dropped == 1 {
                    let err = DeliveryError::SinkUnresponsive {
                        subscription_id: id.to_string(),
                        dropped,
                    };
                    tracing::warn!(subscription_id = %id, error = %err, "Subscriber queue full");
                }
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    fn remove_closed(&self, closed: Vec<Uuid>) {
        if closed.is_empty() {
            return;
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        for id in closed {
            if slots.remove(&id).is_some() {
                tracing::debug!(subscription_id = %id, "Closed subscription removed");
            }
        }
    }
}

// ============================================================================
// SUBSCRIPTION HANDLE
// ============================================================================

/// Handle for one live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    engine: Arc<FanoutEngine>,
    slot: Arc<Slot>,
    rx: mpsc::Receiver<LogEvent>,
    backlog: Vec<SequencedRecord>,
    /// Live records at or below this sequence were covered by the backlog.
    covered_seq: u64,
    closed: bool,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Backlog records, oldest first. Deliver these before any live event.
    pub fn backlog(&self) -> &[SequencedRecord] {
        &self.backlog
    }

    /// Take ownership of the backlog, leaving it empty.
    pub fn take_backlog(&mut self) -> Vec<SequencedRecord> {
        std::mem::take(&mut self.backlog)
    }

    /// Wait for the next live event. Returns `None` once closed.
    pub async fn next(&mut self) -> Option<LogEvent> {
        loop {
            let event = self.rx.recv().await?;
            if !self.already_delivered(&event) {
                return Some(event);
            }
        }
    }

    /// Next queued event without waiting.
    pub fn try_next(&mut self) -> Option<LogEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.already_delivered(&event) => continue,
                Ok(event) => return Some(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return None,
            }
        }
    }

    fn already_delivered(&self, event: &LogEvent) -> bool {
        matches!(event, LogEvent::Record(entry) if entry.seq <= self.covered_seq)
    }

    pub fn update_filter(&self, spec: &FilterSpec) -> Result<bool, FilterError> {
        self.engine.update_filter(self.id, spec)
    }

    /// Current filter, in wire form.
    pub fn filter(&self) -> FilterSpec {
        self.slot
            .filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .to_spec()
    }

    /// Records dropped for this subscription because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    /// Unsubscribe. Events already queued can still be drained.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.engine.unsubscribe(self.id);
            self.rx.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("backlog", &self.backlog.len())
            .field("covered_seq", &self.covered_seq)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nodewatch_core::{LogLevel, LogRecord};

    fn engine(capacity: usize, config: FanoutConfig) -> Arc<FanoutEngine> {
        FanoutEngine::new(Arc::new(RingBuffer::new(capacity)), config)
    }

    fn ingest(engine: &FanoutEngine, source: &str, level: LogLevel, message: &str) -> usize {
        let entry = engine
            .ring()
            .append(LogRecord::new(Utc::now(), level, source, message));
        engine.publish(&entry)
    }

    fn drain_messages(sub: &mut Subscription) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(event) = sub.try_next() {
            if let Some(entry) = event.as_record() {
                out.push(entry.record.message.clone());
            }
        }
        out
    }

    #[test]
    fn test_invalid_filter_registers_nothing() {
        let engine = engine(10, FanoutConfig::default());
        let spec = FilterSpec {
            patterns: vec![],
            min_level: Some("LOUD".into()),
        };
        assert!(engine.subscribe(&spec).is_err());
        assert_eq!(engine.subscriber_count(), 0);
    }

    #[test]
    fn test_backlog_is_filtered_and_capped() {
        let engine = engine(10, FanoutConfig::default().with_replay_size(2));
        ingest(&engine, "/sensing/lidar", LogLevel::Warn, "w1");
        ingest(&engine, "/planning", LogLevel::Error, "other");
        ingest(&engine, "/sensing/lidar", LogLevel::Info, "quiet");
        ingest(&engine, "/sensing/camera", LogLevel::Error, "e1");
        ingest(&engine, "/sensing/lidar", LogLevel::Fatal, "f1");

        let sub = engine
            .subscribe(&FilterSpec::new(["/sensing"], Some(LogLevel::Warn)))
            .unwrap();
        let backlog: Vec<_> = sub.backlog().iter().map(|e| e.record.message.as_str()).collect();
        assert_eq!(backlog, vec!["e1", "f1"]);
    }

    #[test]
    fn test_slow_subscriber_drops_only_its_own_records() {
        let engine = engine(100, FanoutConfig::default().with_queue_capacity(2));
        let mut slow = engine.subscribe(&FilterSpec::match_all()).unwrap();
        let mut fast = engine.subscribe(&FilterSpec::match_all()).unwrap();

        for i in 0..2 {
            ingest(&engine, "/n", LogLevel::Info, &i.to_string());
        }
        assert_eq!(drain_messages(&mut fast), vec!["0", "1"]);
        for i in 2..4 {
            ingest(&engine, "/n", LogLevel::Info, &i.to_string());
        }

        assert_eq!(slow.dropped(), 2);
        assert_eq!(fast.dropped(), 0);
        assert_eq!(drain_messages(&mut fast), vec!["2", "3"]);
        assert_eq!(drain_messages(&mut slow), vec!["0", "1"]);
        assert_eq!(engine.stats().dropped, 2);
    }

    #[test]
    fn test_drop_and_close_unsubscribe() {
        let engine = engine(10, FanoutConfig::default());
        let sub = engine.subscribe(&FilterSpec::match_all()).unwrap();
        let mut other = engine.subscribe(&FilterSpec::match_all()).unwrap();
        assert_eq!(engine.subscriber_count(), 2);

        let id = sub.id();
        drop(sub);
        assert_eq!(engine.subscriber_count(), 1);
        assert!(!engine.unsubscribe(id));

        other.close();
        other.close();
        assert!(other.is_closed());
        assert_eq!(engine.subscriber_count(), 0);
    }

    #[test]
    fn test_update_filter_unknown_subscription() {
        let engine = engine(10, FanoutConfig::default());
        let result = engine.update_filter(Uuid::now_v7(), &FilterSpec::match_all());
        assert_eq!(result, Ok(false));
    }

    #[test]
    fn test_gap_ignores_filters() {
        let engine = engine(10, FanoutConfig::default());
        let mut sub = engine
            .subscribe(&FilterSpec::new(["/nothing"], Some(LogLevel::Fatal)))
            .unwrap();

        assert_eq!(engine.publish_gap(&GapNotice::new("/rosout", 0, "eof")), 1);
        let event = sub.try_next().unwrap();
        assert!(event.is_gap());
        assert_eq!(event.event_type(), "gap");
    }

    #[test]
    fn test_records_covered_by_backlog_are_skipped() {
        let engine = engine(10, FanoutConfig::default());
        // Simulate a record appended after registration but before the
        // backlog snapshot: it reaches both the queue and the backlog.
        let mut sub = engine.subscribe(&FilterSpec::match_all()).unwrap();
        let entry = engine
            .ring()
            .append(LogRecord::new(Utc::now(), LogLevel::Info, "/n", "late"));
        sub.covered_seq = entry.seq;
        sub.backlog.push(entry.clone());
        engine.publish(&entry);

        assert!(sub.try_next().is_none());
        ingest(&engine, "/n", LogLevel::Info, "next");
        assert_eq!(drain_messages(&mut sub), vec!["next"]);
    }
}

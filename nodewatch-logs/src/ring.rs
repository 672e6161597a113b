//! Fixed-capacity history of recent log records.
//!
//! The ingestion pump is the only writer. Readers take a short read lock and
//! copy `Arc`s out, so a snapshot is a point-in-time copy that later appends
//! never alter.

use nodewatch_core::LogRecord;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A record tagged with its position in the source's stream.
///
/// Sequence numbers start at 1 and increase by one per append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequencedRecord {
    pub seq: u64,
    #[serde(flatten)]
    pub record: Arc<LogRecord>,
}

#[derive(Debug)]
struct RingState {
    records: VecDeque<SequencedRecord>,
    last_seq: u64,
}

/// Bounded ring of the most recent records; the oldest is evicted first.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    state: RwLock<RingState>,
}

impl RingBuffer {
    /// Create a ring holding at most `capacity` records. A capacity of zero is
    /// raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: RwLock::new(RingState {
                records: VecDeque::with_capacity(capacity),
                last_seq: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RingState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RingState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a record, evicting the oldest when full.
    pub fn append(&self, record: impl Into<Arc<LogRecord>>) -> SequencedRecord {
        let mut state = self.write();
        state.last_seq += 1;
        let entry = SequencedRecord {
            seq: state.last_seq,
            record: record.into(),
        };
        if state.records.len() == self.capacity {
            state.records.pop_front();
        }
        state.records.push_back(entry.clone());
        entry
    }

    /// The most recent `min(max_count, len)` records, oldest first.
    pub fn snapshot(&self, max_count: usize) -> Vec<SequencedRecord> {
        let state = self.read();
        let skip = state.records.len().saturating_sub(max_count);
        state.records.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sequence number of the newest record, 0 if nothing was appended yet.
    pub fn last_seq(&self) -> u64 {
        self.read().last_seq
    }

    /// Records appended over the ring's lifetime, including evicted ones.
    pub fn total_appended(&self) -> u64 {
        self.last_seq()
    }
}

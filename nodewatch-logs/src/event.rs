//! Events delivered to log subscribers.

use crate::ring::SequencedRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Notice that the upstream stream was interrupted and records may be missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GapNotice {
    pub source_id: String,
    /// When the interruption was detected.
    pub at: DateTime<Utc>,
    /// Sequence number of the last record ingested before the gap.
    pub last_seq: u64,
    pub reason: String,
}

impl GapNotice {
    pub fn new(source_id: impl Into<String>, last_seq: u64, reason: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            at: Utc::now(),
            last_seq,
            reason: reason.into(),
        }
    }
}

/// Item in a subscription's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Record(SequencedRecord),
    Gap(GapNotice),
}

impl LogEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LogEvent::Record(_) => "record",
            LogEvent::Gap(_) => "gap",
        }
    }

    pub fn as_record(&self) -> Option<&SequencedRecord> {
        match self {
            LogEvent::Record(record) => Some(record),
            LogEvent::Gap(_) => None,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, LogEvent::Gap(_))
    }
}

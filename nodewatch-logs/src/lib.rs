//! Nodewatch Logs - Single-ingestion log distribution
//!
//! One pump per log source reads the upstream stream into a bounded ring
//! buffer and fans each record out to every subscription whose filter matches
//! it. New subscribers get a filtered backlog before any live record; slow
//! subscribers lose records without slowing anyone else down.

pub mod decode;
pub mod event;
pub mod fanout;
pub mod hub;
pub mod pump;
pub mod ring;
pub mod source;

pub use decode::{DecodeError, DecoderFactory, JsonLineDecoder, RecordDecoder, RosoutDecoder};
pub use event::{GapNotice, LogEvent};
pub use fanout::{FanoutConfig, FanoutEngine, FanoutStats, Subscription};
pub use hub::{ChannelStatus, LogChannel, LogConfig, LogHub};
pub use pump::{BackoffConfig, IngestionPump, PumpHandle, PumpState, PumpStats};
pub use ring::{RingBuffer, SequencedRecord};
pub use source::{LineSource, LineStream};

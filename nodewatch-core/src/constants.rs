//! Constants shared across nodewatch crates.

// ============================================================================
// CACHE
// ============================================================================

/// Default time-to-live for cached inspection results (seconds).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 5;

/// Default upper bound for a single collaborator fetch (seconds).
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// LOG PIPELINE
// ============================================================================

/// Default number of records kept in a source's ring buffer.
pub const DEFAULT_RING_CAPACITY: usize = 1000;

/// Default number of backlog records replayed to a new subscriber.
pub const DEFAULT_REPLAY_SIZE: usize = 100;

/// Default per-subscription queue depth before records are dropped.
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

/// Maximum number of name patterns in one filter.
pub const MAX_FILTER_PATTERNS: usize = 64;

/// Maximum length of a single name pattern.
pub const MAX_PATTERN_LEN: usize = 256;

/// Log source that carries every node's output.
pub const ROSOUT_SOURCE: &str = "/rosout";

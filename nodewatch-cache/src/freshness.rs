//! Freshness contracts for cache reads.
//!
//! Callers state how much staleness they accept, and reads come back as a
//! [`CacheRead`] that says whether the value is past its TTL.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Freshness requirement for a cache read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Never return an expired value. An expired or missing entry is fetched
    /// synchronously (or joined if a fetch is already in flight).
    #[default]
    Fresh,

    /// Accept an expired value for up to `max_staleness` past its expiry.
    ///
    /// The stale value is returned immediately, flagged as stale, and a
    /// deduplicated refresh is started in the background. Entries older than
    /// that are treated as `Fresh` reads.
    StaleTolerant {
        /// How long past expiry a value may still be served.
        max_staleness: Duration,
    },
}

impl Freshness {
    pub fn fresh() -> Self {
        Self::Fresh
    }

    pub fn stale_tolerant(max_staleness: Duration) -> Self {
        Self::StaleTolerant { max_staleness }
    }

    pub fn is_stale_tolerant(&self) -> bool {
        matches!(self, Self::StaleTolerant { .. })
    }

    /// Staleness past expiry this read accepts; zero for `Fresh`.
    pub fn max_staleness(&self) -> Duration {
        match self {
            Self::StaleTolerant { max_staleness } => *max_staleness,
            Self::Fresh => Duration::ZERO,
        }
    }
}

/// Result of a cache read, carrying staleness metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    /// When the value was fetched from the collaborator.
    fetched_at: DateTime<Utc>,
    /// True if the value is past its TTL.
    stale: bool,
    was_cache_hit: bool,
}

impl<T> CacheRead<T> {
    /// Value served from a live entry.
    pub fn hit(value: T, fetched_at: DateTime<Utc>) -> Self {
        Self {
            value,
            fetched_at,
            stale: false,
            was_cache_hit: true,
        }
    }

    /// Expired value served to a stale-tolerant caller.
    pub fn stale(value: T, fetched_at: DateTime<Utc>) -> Self {
        Self {
            value,
            fetched_at,
            stale: true,
            was_cache_hit: true,
        }
    }

    /// Value that came from a fetch (own or joined).
    pub fn fetched(value: T, fetched_at: DateTime<Utc>) -> Self {
        Self {
            value,
            fetched_at,
            stale: false,
            was_cache_hit: false,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Time since the value was fetched.
    pub fn staleness(&self) -> Duration {
        (Utc::now() - self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            fetched_at: self.fetched_at,
            stale: self.stale,
            was_cache_hit: self.was_cache_hit,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_default_is_fresh() {
        let freshness = Freshness::default();
        assert_eq!(freshness, Freshness::Fresh);
        assert!(!freshness.is_stale_tolerant());
        assert_eq!(freshness.max_staleness(), Duration::ZERO);
    }

    #[test]
    fn test_stale_tolerant() {
        let freshness = Freshness::stale_tolerant(Duration::from_secs(60));
        assert!(freshness.is_stale_tolerant());
        assert_eq!(freshness.max_staleness(), Duration::from_secs(60));
    }

    #[test]
    fn test_cache_read_flags() {
        let now = Utc::now();
        let hit = CacheRead::hit(1, now);
        assert!(hit.was_cache_hit());
        assert!(!hit.is_stale());

        let stale = CacheRead::stale(2, now);
        assert!(stale.was_cache_hit());
        assert!(stale.is_stale());

        let fetched = CacheRead::fetched(3, now);
        assert!(fetched.was_cache_miss());
        assert_eq!(fetched.into_value(), 3);
    }

    #[test]
    fn test_cache_read_staleness() {
        let past = Utc::now() - chrono::Duration::seconds(5);
        let read = CacheRead::hit("v", past);
        let staleness = read.staleness();
        assert!(staleness >= Duration::from_secs(4));
        assert!(staleness <= Duration::from_secs(10));
    }

    #[test]
    fn test_cache_read_map_keeps_metadata() {
        let read = CacheRead::stale(42i32, Utc::now()).map(|v| v.to_string());
        assert!(read.is_stale());
        assert_eq!(read.into_value(), "42");
    }
}

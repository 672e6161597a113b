//! Fetcher trait and cache statistics.

use async_trait::async_trait;
use nodewatch_core::FetchError;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Collaborator that produces the value for a cache key.
///
/// Implementations are expected to be slow (an out-of-process inspection
/// command) and may fail; failures are never cached.
#[async_trait]
pub trait Fetcher<V>: Send + Sync {
    /// Fetch the current value for `key`.
    async fn fetch(&self, key: &str) -> Result<V, FetchError>;
}

/// Adapter turning an async closure into a [`Fetcher`].
pub struct FnFetcher<F, V> {
    f: F,
    _value: PhantomData<fn() -> V>,
}

impl<F, V> FnFetcher<F, V> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _value: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, V> Fetcher<V> for FnFetcher<F, V>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, FetchError>> + Send,
    V: Send + 'static,
{
    async fn fetch(&self, key: &str) -> Result<V, FetchError> {
        (self.f)(key.to_string()).await
    }
}

/// Wrap an async closure as a [`Fetcher`].
pub fn fn_fetcher<F, Fut, V>(f: F) -> FnFetcher<F, V>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V, FetchError>> + Send,
{
    FnFetcher::new(f)
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Reads answered from a live entry.
    pub hits: u64,
    /// Reads that had to fetch or wait for a fetch.
    pub misses: u64,
    /// Expired values served to stale-tolerant readers.
    pub stale_hits: u64,
    /// Readers that joined a fetch already in flight.
    pub coalesced: u64,
    /// Collaborator fetches started.
    pub fetches: u64,
    /// Fetches that failed or timed out.
    pub fetch_errors: u64,
    /// Entries removed by invalidation.
    pub invalidations: u64,
    /// Entries currently cached.
    pub entries: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0). Stale hits count as hits.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

/// Live counters behind [`CacheStats`].
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub stale_hits: AtomicU64,
    pub coalesced: AtomicU64,
    pub fetches: AtomicU64,
    pub fetch_errors: AtomicU64,
    pub invalidations: AtomicU64,
}

impl CacheCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entries: usize) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: entries as u64,
        }
    }
}

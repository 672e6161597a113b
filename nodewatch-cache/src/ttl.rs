//! TTL cache with singleflight fetch deduplication.
//!
//! Every key has at most one collaborator fetch in flight. Readers arriving
//! while that fetch runs wait on it and receive its outcome, success or
//! failure. Successful results are stored until their TTL elapses; failures
//! are never stored.
//!
//! # Concurrency
//!
//! Entries and in-flight fetches live in two sharded maps. Whenever both are
//! needed the in-flight map is locked first. Fetches run on their own task so
//! a fetch whose waiters were all cancelled still completes and populates the
//! cache.
//!
//! # Invalidation
//!
//! Invalidating a key removes its entry and marks its in-flight fetch as
//! detached. A detached fetch still answers the readers already waiting on it
//! but does not write its result. The first read after the invalidation queues
//! a successor fetch that starts only once the detached one has finished, so
//! the key never has two collaborator calls running at once and the read still
//! sees data fetched after the mutation.

use crate::freshness::{CacheRead, Freshness};
use crate::traits::{CacheCounters, CacheStats};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nodewatch_core::constants::{DEFAULT_CACHE_TTL_SECS, DEFAULT_FETCH_TIMEOUT_SECS};
use nodewatch_core::FetchError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for a [`TtlCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used by callers that don't pick their own.
    pub default_ttl: Duration,
    /// Upper bound on a single fetch. `None` lets fetches run indefinitely.
    pub fetch_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            fetch_timeout: Some(Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Let fetches run without a timeout.
    pub fn without_fetch_timeout(mut self) -> Self {
        self.fetch_timeout = None;
        self
    }
}

// ============================================================================
// CACHE
// ============================================================================

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    fetched_at: DateTime<Utc>,
}

impl<V: Clone> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn read(&self, stale: bool) -> CacheRead<V> {
        if stale {
            CacheRead::stale(self.value.clone(), self.fetched_at)
        } else {
            CacheRead::hit(self.value.clone(), self.fetched_at)
        }
    }
}

/// Published once by the fetch task; `None` until then.
type FetchOutcome<V> = Option<Result<(V, DateTime<Utc>), FetchError>>;

struct Inflight<V> {
    id: u64,
    rx: watch::Receiver<FetchOutcome<V>>,
    /// Set by invalidation; the result is handed to waiters but not stored.
    detached: bool,
}

enum Flight<V> {
    /// Another fetch filled the entry while we were deciding.
    Cached(CacheRead<V>),
    Pending(watch::Receiver<FetchOutcome<V>>),
}

struct Inner<V> {
    entries: DashMap<String, CacheEntry<V>>,
    inflight: DashMap<String, Inflight<V>>,
    next_fetch_id: AtomicU64,
    counters: CacheCounters,
    config: CacheConfig,
}

/// Key-addressed cache with expiry and per-key fetch deduplication.
///
/// Cloning is cheap; clones share the same entries.
pub struct TtlCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                inflight: DashMap::new(),
                next_fetch_id: AtomicU64::new(1),
                counters: CacheCounters::default(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Return the live value for `key`, fetching it if missing or expired.
    ///
    /// Concurrent callers for the same key share a single call to `fetch`;
    /// only the caller that starts the fetch has its closure invoked.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: impl AsRef<str>,
        ttl: Duration,
        fetch: F,
    ) -> Result<V, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        self.get(key, ttl, Freshness::Fresh, fetch)
            .await
            .map(CacheRead::into_value)
    }

    /// Read `key` under an explicit freshness contract.
    ///
    /// With [`Freshness::StaleTolerant`], an expired value still inside the
    /// staleness window is returned at once, flagged stale, and a refresh is
    /// started in the background.
    pub async fn get<F, Fut>(
        &self,
        key: impl AsRef<str>,
        ttl: Duration,
        freshness: Freshness,
        fetch: F,
    ) -> Result<CacheRead<V>, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let key = key.as_ref();
        let now = Instant::now();

        let stale_read = match self.inner.entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                CacheCounters::incr(&self.inner.counters.hits);
                return Ok(entry.read(false));
            }
            Some(entry) => match freshness {
                Freshness::StaleTolerant { max_staleness }
                    if now.duration_since(entry.expires_at) <= max_staleness =>
                {
                    Some(entry.read(true))
                }
                _ => None,
            },
            None => None,
        };

        if let Some(read) = stale_read {
            CacheCounters::incr(&self.inner.counters.stale_hits);
            tracing::debug!(key = %key, "Serving stale value, refreshing in background");
            // The receiver is dropped; the fetch runs to completion regardless.
            let _ = self.join_or_start(key, ttl, fetch, false);
            return Ok(read);
        }

        CacheCounters::incr(&self.inner.counters.misses);
        match self.join_or_start(key, ttl, fetch, false) {
            Flight::Cached(read) => Ok(read),
            Flight::Pending(rx) => Self::wait(key, rx).await,
        }
    }

    /// Fetch `key` even if its entry is live.
    ///
    /// Goes through the same singleflight path as reads: if a fetch for the
    /// key is already running, this joins it instead of starting another.
    pub async fn refresh<F, Fut>(
        &self,
        key: impl AsRef<str>,
        ttl: Duration,
        fetch: F,
    ) -> Result<V, FetchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let key = key.as_ref();
        match self.join_or_start(key, ttl, fetch, true) {
            Flight::Cached(read) => Ok(read.into_value()),
            Flight::Pending(rx) => Self::wait(key, rx).await.map(CacheRead::into_value),
        }
    }

    /// Current entry for `key` without fetching. Expired entries are returned
    /// flagged stale.
    pub fn peek(&self, key: impl AsRef<str>) -> Option<CacheRead<V>> {
        let now = Instant::now();
        self.inner
            .entries
            .get(key.as_ref())
            .map(|entry| entry.read(!entry.is_live(now)))
    }

    /// Whether a fetch for `key` is currently running.
    pub fn is_fetching(&self, key: impl AsRef<str>) -> bool {
        self.inner.inflight.contains_key(key.as_ref())
    }

    /// Remove `key` and detach its in-flight fetch. Idempotent.
    ///
    /// Returns true if an entry was removed.
    pub fn invalidate(&self, key: impl AsRef<str>) -> bool {
        let key = key.as_ref();
        if let Some(mut flight) = self.inner.inflight.get_mut(key) {
            flight.detached = true;
        }
        let removed = self.inner.entries.remove(key).is_some();
        if removed {
            CacheCounters::incr(&self.inner.counters.invalidations);
        }
        tracing::debug!(key = %key, removed, "Cache key invalidated");
        removed
    }

    /// Remove every key starting with `prefix`. Returns the number of entries
    /// removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        for mut flight in self.inner.inflight.iter_mut() {
            if flight.key().starts_with(prefix) {
                flight.detached = true;
            }
        }

        let mut removed = 0usize;
        self.inner.entries.retain(|key, _| {
            let keep = !key.starts_with(prefix);
            if !keep {
                removed += 1;
            }
            keep
        });

        self.inner
            .counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!(prefix = %prefix, removed, "Cache prefix invalidated");
        removed
    }

    /// Number of cached entries, live or expired.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot(self.inner.entries.len())
    }

    // ------------------------------------------------------------------------
    // Singleflight
    // ------------------------------------------------------------------------

    fn join_or_start<F, Fut>(&self, key: &str, ttl: Duration, fetch: F, force: bool) -> Flight<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let (id, tx, rx, predecessor) = match self.inner.inflight.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                if !slot.get().detached {
                    CacheCounters::incr(&self.inner.counters.coalesced);
                    return Flight::Pending(slot.get().rx.clone());
                }
                // Queue behind the detached fetch instead of running beside it.
                let predecessor = slot.get().rx.clone();
                let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                slot.insert(Inflight {
                    id,
                    rx: rx.clone(),
                    detached: false,
                });
                (id, tx, rx, Some(predecessor))
            }
            Entry::Vacant(slot) => {
                if !force {
                    // A fetch may have completed between the caller's lookup
                    // and taking the in-flight slot.
                    if let Some(entry) = self.inner.entries.get(key) {
                        if entry.is_live(Instant::now()) {
                            return Flight::Cached(entry.read(false));
                        }
                    }
                }
                let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                slot.insert(Inflight {
                    id,
                    rx: rx.clone(),
                    detached: false,
                });
                (id, tx, rx, None)
            }
        };

        CacheCounters::incr(&self.inner.counters.fetches);
        tracing::debug!(
            key = %key,
            fetch_id = id,
            queued = predecessor.is_some(),
            "Cache fetch started"
        );

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            let guard = InflightGuard {
                inner: Arc::clone(&inner),
                key: key.clone(),
                id,
            };

            if let Some(mut predecessor) = predecessor {
                // Sender dropped means the detached fetch is gone too.
                let _ = predecessor.wait_for(Option::is_some).await;
            }

            let result = match inner.config.fetch_timeout {
                Some(limit) => match tokio::time::timeout(limit, fetch()).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::timeout(key.clone(), limit)),
                },
                None => fetch().await,
            };

            let outcome = inner.complete(&key, id, ttl, result);
            drop(guard);
            // No receivers left is fine; the entry is already stored.
            let _ = tx.send(Some(outcome));
        });

        Flight::Pending(rx)
    }

    async fn wait(
        key: &str,
        mut rx: watch::Receiver<FetchOutcome<V>>,
    ) -> Result<CacheRead<V>, FetchError> {
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => match &*outcome {
                Some(Ok((value, fetched_at))) => Ok(CacheRead::fetched(value.clone(), *fetched_at)),
                Some(Err(err)) => Err(err.clone()),
                None => Err(FetchError::failed(key, "fetch finished without a result")),
            },
            Err(_) => Err(FetchError::failed(key, "fetch task ended without a result")),
        }
    }
}

impl<V: Clone> Inner<V> {
    /// Record a finished fetch. Only the fetch still registered for the key
    /// may write its value.
    fn complete(
        &self,
        key: &str,
        id: u64,
        ttl: Duration,
        result: Result<V, FetchError>,
    ) -> Result<(V, DateTime<Utc>), FetchError> {
        match result {
            Ok(value) => {
                let fetched_at = Utc::now();
                // Holding the slot keeps a concurrent invalidation out until
                // the entry is written.
                let flight = self.inflight.get(key);
                match &flight {
                    Some(current) if current.id == id && !current.detached => {
                        self.entries.insert(
                            key.to_string(),
                            CacheEntry {
                                value: value.clone(),
                                expires_at: Instant::now() + ttl,
                                fetched_at,
                            },
                        );
                    }
                    _ => {
                        tracing::debug!(key = %key, fetch_id = id, "Detached fetch result discarded");
                    }
                }
                drop(flight);
                self.inflight.remove_if(key, |_, flight| flight.id == id);
                Ok((value, fetched_at))
            }
            Err(err) => {
                CacheCounters::incr(&self.counters.fetch_errors);
                self.inflight.remove_if(key, |_, flight| flight.id == id);
                tracing::warn!(key = %key, error = %err, "Cache fetch failed");
                Err(err)
            }
        }
    }
}

/// Clears the in-flight marker if the fetch task unwinds before completing.
struct InflightGuard<V> {
    inner: Arc<Inner<V>>,
    key: String,
    id: u64,
}

impl<V> Drop for InflightGuard<V> {
    fn drop(&mut self) {
        let id = self.id;
        self.inner
            .inflight
            .remove_if(&self.key, |_, flight| flight.id == id);
    }
}

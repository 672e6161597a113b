//! Singleflight and expiry behavior of the TTL cache.

use futures_util::future::join_all;
use nodewatch_cache::{CacheConfig, Freshness, TtlCache};
use nodewatch_core::FetchError;
use nodewatch_test_utils::ScriptedFetcher;
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(5);
const FETCH_DELAY: Duration = Duration::from_secs(1);

fn cache() -> TtlCache<String> {
    TtlCache::new(CacheConfig::default())
}

fn slow_fetcher(value: &str) -> Arc<ScriptedFetcher<String>> {
    Arc::new(ScriptedFetcher::ok(value.to_string()).with_delay(FETCH_DELAY))
}

#[tokio::test(start_paused = true)]
async fn concurrent_cold_reads_share_one_fetch() {
    let cache = cache();
    let fetcher = slow_fetcher("nodes");

    let reads = (0..50).map(|_| cache.get_or_fetch("node_list:all", TTL, fetcher.fetch_fn("node_list:all")));
    let results = join_all(reads).await;

    assert_eq!(fetcher.calls(), 1);
    assert!(results.iter().all(|r| r.as_deref() == Ok("nodes")));

    let stats = cache.stats();
    assert_eq!(stats.fetches, 1);
    assert_eq!(stats.misses, 50);
    assert_eq!(stats.coalesced, 49);
}

#[tokio::test(start_paused = true)]
async fn concurrent_spawned_reads_share_one_fetch() {
    let cache = cache();
    let fetcher = slow_fetcher("info");

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let cache = cache.clone();
            let fetch = fetcher.fetch_fn("node_info:/a");
            tokio::spawn(async move { cache.get_or_fetch("node_info:/a", TTL, fetch).await })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), "info");
    }
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn failure_is_shared_and_not_cached() {
    let cache = cache();
    let fetcher: Arc<ScriptedFetcher<String>> =
        Arc::new(ScriptedFetcher::failing("exit status 1").with_delay(FETCH_DELAY));

    let reads = (0..10).map(|_| cache.get_or_fetch("node_info:/a", TTL, fetcher.fetch_fn("node_info:/a")));
    let results = join_all(reads).await;

    assert_eq!(fetcher.calls(), 1);
    let expected = FetchError::failed("node_info:/a", "exit status 1");
    assert!(results.iter().all(|r| r.as_ref().unwrap_err() == &expected));
    assert!(cache.peek("node_info:/a").is_none());
    assert!(!cache.is_fetching("node_info:/a"));

    // The next read tries again.
    let _ = cache
        .get_or_fetch("node_info:/a", TTL, fetcher.fetch_fn("node_info:/a"))
        .await;
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(cache.stats().fetch_errors, 2);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_is_refetched() {
    let cache = cache();
    let fetcher = Arc::new(
        ScriptedFetcher::ok("second".to_string()).then(Ok("first".to_string())),
    );

    let first = cache.get_or_fetch("k", TTL, fetcher.fetch_fn("k")).await.unwrap();
    assert_eq!(first, "first");

    tokio::time::advance(TTL - Duration::from_millis(1)).await;
    let cached = cache.get_or_fetch("k", TTL, fetcher.fetch_fn("k")).await.unwrap();
    assert_eq!(cached, "first");
    assert_eq!(fetcher.calls(), 1);

    tokio::time::advance(Duration::from_millis(2)).await;
    let refreshed = cache.get_or_fetch("k", TTL, fetcher.fetch_fn("k")).await.unwrap();
    assert_eq!(refreshed, "second");
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn abandoned_fetch_still_populates_cache() {
    let cache = cache();
    let fetcher = slow_fetcher("v");

    let waiter = {
        let cache = cache.clone();
        let fetch = fetcher.fetch_fn("k");
        tokio::spawn(async move { cache.get_or_fetch("k", TTL, fetch).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(cache.is_fetching("k"));
    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());

    tokio::time::sleep(FETCH_DELAY).await;
    assert_eq!(cache.peek("k").unwrap().value(), "v");
    assert!(!cache.is_fetching("k"));

    let value = cache.get_or_fetch("k", TTL, fetcher.fetch_fn("k")).await.unwrap();
    assert_eq!(value, "v");
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalidation_queues_next_fetch_behind_detached_one() {
    let cache = cache();
    let fetcher = Arc::new(
        ScriptedFetcher::ok("after".to_string())
            .then(Ok("before".to_string()))
            .with_delay(FETCH_DELAY * 3),
    );

    let early = {
        let cache = cache.clone();
        let fetch = fetcher.fetch_fn("node_list:all");
        tokio::spawn(async move { cache.get_or_fetch("node_list:all", TTL, fetch).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    cache.invalidate("node_list:all");
    assert!(cache.is_fetching("node_list:all"));

    // Reads after the mutation share one fetch that waits for the detached one.
    let late: Vec<_> = (0..3)
        .map(|_| {
            let cache = cache.clone();
            let fetch = fetcher.fetch_fn("node_list:all");
            tokio::spawn(async move { cache.get_or_fetch("node_list:all", TTL, fetch).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fetcher.calls(), 1);

    assert_eq!(early.await.unwrap().unwrap(), "before");
    for read in late {
        assert_eq!(read.await.unwrap().unwrap(), "after");
    }
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(fetcher.peak_concurrency(), 1);
    assert_eq!(cache.peek("node_list:all").unwrap().value(), "after");
    assert!(!cache.is_fetching("node_list:all"));
}

#[tokio::test(start_paused = true)]
async fn prefix_invalidation_also_serializes_fetches() {
    let cache = cache();
    let fetcher = slow_fetcher("info");

    let early = cache.get_or_fetch("node_info:/a", TTL, fetcher.fetch_fn("node_info:/a"));
    let late = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.invalidate_prefix("node_info:"), 0);
        cache
            .get_or_fetch("node_info:/a", TTL, fetcher.fetch_fn("node_info:/a"))
            .await
    };
    let (early, late) = tokio::join!(early, late);

    assert_eq!(early.unwrap(), "info");
    assert_eq!(late.unwrap(), "info");
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(fetcher.peak_concurrency(), 1);
}

#[tokio::test(start_paused = true)]
async fn detached_result_is_not_stored() {
    let cache = cache();
    let fetcher = slow_fetcher("stale");

    let waiter = {
        let cache = cache.clone();
        let fetch = fetcher.fetch_fn("k");
        tokio::spawn(async move { cache.get_or_fetch("k", TTL, fetch).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.invalidate("k");

    assert_eq!(waiter.await.unwrap().unwrap(), "stale");
    assert!(cache.peek("k").is_none());
}

#[tokio::test(start_paused = true)]
async fn stale_tolerant_read_returns_immediately_and_refreshes() {
    let cache = cache();
    let fetcher = Arc::new(
        ScriptedFetcher::ok("v2".to_string())
            .then(Ok("v1".to_string()))
            .with_delay(FETCH_DELAY),
    );
    let ttl = Duration::from_secs(1);

    cache.get_or_fetch("k", ttl, fetcher.fetch_fn("k")).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let freshness = Freshness::stale_tolerant(Duration::from_secs(10));
    let read = cache.get("k", ttl, freshness, fetcher.fetch_fn("k")).await.unwrap();
    assert!(read.is_stale());
    assert!(read.was_cache_hit());
    assert_eq!(read.value(), "v1");
    assert!(cache.is_fetching("k"));

    // A second stale read joins the background refresh instead of starting one.
    let again = cache.get("k", ttl, freshness, fetcher.fetch_fn("k")).await.unwrap();
    assert!(again.is_stale());

    tokio::time::sleep(FETCH_DELAY + Duration::from_millis(10)).await;
    assert_eq!(fetcher.calls(), 2);
    let read = cache.peek("k").unwrap();
    assert!(!read.is_stale());
    assert_eq!(read.value(), "v2");
    assert_eq!(cache.stats().stale_hits, 2);
}

#[tokio::test(start_paused = true)]
async fn stale_tolerance_has_a_limit() {
    let cache = cache();
    let fetcher = Arc::new(ScriptedFetcher::ok("v2".to_string()).then(Ok("v1".to_string())));
    let ttl = Duration::from_secs(1);

    cache.get_or_fetch("k", ttl, fetcher.fetch_fn("k")).await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;

    let read = cache
        .get("k", ttl, Freshness::stale_tolerant(Duration::from_secs(10)), fetcher.fetch_fn("k"))
        .await
        .unwrap();
    assert!(!read.is_stale());
    assert!(read.was_cache_miss());
    assert_eq!(read.value(), "v2");
}

#[tokio::test(start_paused = true)]
async fn fresh_read_never_returns_expired_value() {
    let cache = cache();
    let fetcher = Arc::new(ScriptedFetcher::ok("v2".to_string()).then(Ok("v1".to_string())));
    let ttl = Duration::from_secs(1);

    cache.get_or_fetch("k", ttl, fetcher.fetch_fn("k")).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let read = cache.get("k", ttl, Freshness::Fresh, fetcher.fetch_fn("k")).await.unwrap();
    assert_eq!(read.value(), "v2");
    assert!(!read.is_stale());
}

#[tokio::test(start_paused = true)]
async fn forced_refresh_replaces_live_value() {
    let cache = cache();
    let fetcher = Arc::new(ScriptedFetcher::ok("new".to_string()).then(Ok("old".to_string())));

    cache.get_or_fetch("k", TTL, fetcher.fetch_fn("k")).await.unwrap();
    let refreshed = cache.refresh("k", TTL, fetcher.fetch_fn("k")).await.unwrap();
    assert_eq!(refreshed, "new");
    assert_eq!(cache.peek("k").unwrap().value(), "new");
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn refresh_joins_inflight_read() {
    let cache = cache();
    let fetcher = slow_fetcher("v");

    let read = cache.get_or_fetch("k", TTL, fetcher.fetch_fn("k"));
    let refresh = cache.refresh("k", TTL, fetcher.fetch_fn("k"));
    let (read, refresh) = tokio::join!(read, refresh);

    assert_eq!(read.unwrap(), "v");
    assert_eq!(refresh.unwrap(), "v");
    assert_eq!(fetcher.calls(), 1);
}

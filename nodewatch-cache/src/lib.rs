//! Nodewatch Cache - Shared inspection state
//!
//! A TTL cache that collapses concurrent fetches for the same key into one
//! collaborator call, plus a scheduler that keeps hot keys warm in the
//! background.
//!
//! # Example
//!
//! ```ignore
//! let cache: TtlCache<serde_json::Value> = TtlCache::new(CacheConfig::default());
//! let nodes = cache
//!     .get_or_fetch(CacheKey::node_list(), Duration::from_secs(5), move || async move {
//!         transport.list_nodes().await
//!     })
//!     .await?;
//! ```

pub mod freshness;
pub mod key;
pub mod scheduler;
pub mod traits;
pub mod ttl;

pub use freshness::{CacheRead, Freshness};
pub use key::{CacheKey, QueryKind};
pub use scheduler::{RefreshScheduler, RefreshTaskStatus, SchedulerConfig};
pub use traits::{fn_fetcher, CacheStats, Fetcher, FnFetcher};
pub use ttl::{CacheConfig, TtlCache};

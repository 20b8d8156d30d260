//! Discovery cache for Waypoint.
//!
//! Caches the instance list returned for a [`ServiceQuery`](waypoint_core::ServiceQuery)
//! under its canonical key.
//!
//! - **TTL** - entries are never served past their lifetime; expired ones are deleted
//! - **Refresh-ahead** - entries nearing expiry are re-fetched in the background
//!   while the current list keeps being served, at most one refresh per key
//! - **LRU eviction** - the least recently used entry makes room when full
//! - **Invalidation** - drop every entry of a service at once
//!
//! ```
//! use std::time::Duration;
//! use waypoint_cache::*;
//! use waypoint_core::ServiceQuery;
//!
//! let cache = DiscoveryCache::new(
//!     CacheConfig::new()
//!         .with_strategy(CacheStrategy::RefreshAhead)
//!         .with_ttl(Duration::from_secs(30)),
//! )
//! .unwrap();
//!
//! let query = ServiceQuery::new("orders");
//! assert!(cache.get(&query, None).is_none());
//! ```

pub mod cache;
pub mod config;

pub use cache::{CacheStats, DiscoveryCache, RefreshCallback, RefreshFuture, refresh_fn};
pub use config::{CacheConfig, CacheStrategy};

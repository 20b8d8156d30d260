//! Discovery cache with TTL expiry, refresh-ahead and LRU eviction.

use std::collections::HashSet;
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use waypoint_core::{BoxError, ConfigError, ConfigResult, ServiceInstance, ServiceQuery, service_of_key};

use crate::config::{CacheConfig, CacheStrategy};

/// Future returned by a refresh callback.
pub type RefreshFuture =
    Pin<Box<dyn Future<Output = Result<Vec<Arc<ServiceInstance>>, BoxError>> + Send>>;

/// Re-fetches the instance list for one cached query.
pub type RefreshCallback = Arc<dyn Fn() -> RefreshFuture + Send + Sync>;

/// Wrap an async closure as a [`RefreshCallback`].
pub fn refresh_fn<F, Fut>(f: F) -> RefreshCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Arc<ServiceInstance>>, BoxError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

struct CacheEntry {
    instances: Vec<Arc<ServiceInstance>>,
    created_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
    access_count: u64,
    refresh: Option<RefreshCallback>,
    /// Bumped by every `put`; a refresh only lands on the entry it started from
    generation: u64,
}

impl CacheEntry {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub evictions: u64,
    pub size: usize,
    pub hit_rate: f64,
}

struct CacheState {
    entries: LruCache<String, CacheEntry>,
    /// Keys with a refresh-ahead task in flight. Outlives entry replacement.
    refreshing: HashSet<String>,
    next_generation: u64,
}

struct CacheInner {
    config: CacheConfig,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    evictions: AtomicU64,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl CacheInner {
    fn complete_refresh(
        &self,
        key: &str,
        generation: u64,
        result: Result<Vec<Arc<ServiceInstance>>, BoxError>,
    ) {
        let mut state = self.state.lock();
        state.refreshing.remove(key);
        let Some(entry) = state.entries.peek_mut(key) else {
            debug!(key = %key, "Refreshed entry no longer cached, dropping result");
            return;
        };
        if entry.generation != generation {
            debug!(key = %key, "Entry replaced during refresh, dropping result");
            return;
        }

        match result {
            Ok(instances) => {
                debug!(key = %key, instances = instances.len(), "Discovery cache entry refreshed");
                entry.instances = instances;
                entry.created_at = Instant::now();
            }
            Err(e) => {
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "Discovery cache refresh failed, serving until expiry");
            }
        }
    }

    fn clear_refreshing(&self, key: &str) {
        self.state.lock().refreshing.remove(key);
    }
}

/// Maps canonical query keys to cached instance lists.
///
/// Cloning is cheap and every clone shares the same entries.
#[derive(Clone)]
pub struct DiscoveryCache {
    inner: Arc<CacheInner>,
}

impl DiscoveryCache {
    /// Build a cache, rejecting an invalid configuration.
    pub fn new(config: CacheConfig) -> ConfigResult<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_size)
            .ok_or_else(|| ConfigError::invalid("cache.max_size", "must be greater than zero"))?;

        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState {
                    entries: LruCache::new(capacity),
                    refreshing: HashSet::new(),
                    next_generation: 0,
                }),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                refreshes: AtomicU64::new(0),
                refresh_failures: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Look up the instances cached for `query`.
    ///
    /// Expired entries are removed and reported as a miss. Under
    /// [`CacheStrategy::RefreshAhead`] an entry older than the refresh
    /// threshold schedules a background refresh and is still returned. At
    /// most one refresh per key is in flight, even across `put` and expiry.
    /// A `refresh` callback passed here is bound to the entry if it has none.
    pub fn get(
        &self,
        query: &ServiceQuery,
        refresh: Option<RefreshCallback>,
    ) -> Option<Vec<Arc<ServiceInstance>>> {
        let inner = &self.inner;
        if inner.config.strategy == CacheStrategy::None {
            inner.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let key = query.cache_key();
        let now = Instant::now();
        let mut guard = inner.state.lock();
        let state = &mut *guard;

        let expired = match state.entries.peek(&key) {
            Some(entry) => entry.age(now) > entry.ttl,
            None => {
                drop(guard);
                inner.misses.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "Discovery cache miss");
                return None;
            }
        };

        if expired {
            state.entries.pop(&key);
            drop(guard);
            inner.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Discovery cache entry expired");
            return None;
        }

        let entry = state.entries.get_mut(&key)?;
        entry.last_accessed = now;
        entry.access_count += 1;
        if entry.refresh.is_none() {
            entry.refresh = refresh;
        }

        let mut scheduled = None;
        if inner.config.strategy == CacheStrategy::RefreshAhead
            && !state.refreshing.contains(&key)
            && entry.age(now) > inner.config.refresh_threshold()
            && let Some(callback) = entry.refresh.clone()
        {
            state.refreshing.insert(key.clone());
            scheduled = Some((callback, entry.generation));
        }

        let instances = entry.instances.clone();
        drop(guard);

        inner.hits.fetch_add(1, Ordering::Relaxed);
        if let Some((callback, generation)) = scheduled {
            self.spawn_refresh(key, generation, callback);
        }
        Some(instances)
    }

    fn spawn_refresh(&self, key: String, generation: u64, callback: RefreshCallback) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(key = %key, "No async runtime available, skipping refresh-ahead");
                self.inner.clear_refreshing(&key);
                return;
            }
        };

        self.inner.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Scheduling refresh-ahead");

        let inner = Arc::clone(&self.inner);
        let token = inner.shutdown.child_token();
        self.inner.tasks.spawn_on(
            async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        inner.clear_refreshing(&key);
                        trace!(key = %key, "Refresh-ahead cancelled");
                    }
                    result = callback() => inner.complete_refresh(&key, generation, result),
                }
            },
            &handle,
        );
    }

    /// Cache `instances` under the key of `query`.
    ///
    /// Inserting a new key into a full cache evicts the least recently
    /// used entry first.
    pub fn put(
        &self,
        query: &ServiceQuery,
        instances: Vec<Arc<ServiceInstance>>,
        refresh: Option<RefreshCallback>,
    ) {
        let inner = &self.inner;
        if inner.config.strategy == CacheStrategy::None {
            return;
        }

        let key = query.cache_key();
        let now = Instant::now();
        let mut guard = inner.state.lock();
        let state = &mut *guard;
        state.next_generation += 1;
        let generation = state.next_generation;

        if !state.entries.contains(&key)
            && state.entries.len() >= inner.config.max_size
            && let Some((evicted, _)) = state.entries.pop_lru()
        {
            inner.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(evicted = %evicted, "Discovery cache full, evicted least recently used entry");
        }

        state.entries.put(
            key,
            CacheEntry {
                instances,
                created_at: now,
                ttl: inner.config.ttl,
                last_accessed: now,
                access_count: 0,
                refresh,
                generation,
            },
        );
    }

    /// Remove every entry cached for `service_name`; returns how many went.
    pub fn invalidate(&self, service_name: &str) -> usize {
        let mut state = self.inner.state.lock();
        let entries = &mut state.entries;
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, _)| service_of_key(key) == service_name)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        if !doomed.is_empty() {
            debug!(service = %service_name, removed = doomed.len(), "Invalidated cached discovery results");
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.inner.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a refresh-ahead is in flight for `query`.
    pub fn is_refreshing(&self, query: &ServiceQuery) -> bool {
        self.inner
            .state
            .lock()
            .refreshing
            .contains(&query.cache_key())
    }

    /// Number of times the entry for `query` was served.
    pub fn access_count(&self, query: &ServiceQuery) -> Option<u64> {
        self.inner
            .state
            .lock()
            .entries
            .peek(&query.cache_key())
            .map(|e| e.access_count)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = &self.inner;
        let hits = inner.hits.load(Ordering::Relaxed);
        let misses = inner.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            refreshes: inner.refreshes.load(Ordering::Relaxed),
            refresh_failures: inner.refresh_failures.load(Ordering::Relaxed),
            evictions: inner.evictions.load(Ordering::Relaxed),
            size: self.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Cancel outstanding refresh tasks and wait up to `timeout` for them.
    ///
    /// Returns `true` if every task finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.tasks.close();

        match tokio::time::timeout(timeout, inner.tasks.wait()).await {
            Ok(()) => {
                info!("Discovery cache shut down");
                true
            }
            Err(_) => {
                warn!(
                    pending = inner.tasks.len(),
                    "Discovery cache shutdown timed out waiting for refresh tasks"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for DiscoveryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCache")
            .field("config", &self.inner.config)
            .field("size", &self.len())
            .finish()
    }
}

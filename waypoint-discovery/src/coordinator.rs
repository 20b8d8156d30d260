//! Resolution flow: cache, registry, breaker filtering, load balancing and
//! outcome feedback.

use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use serde::Serialize;
use tokio::time::{Instant, timeout};
use tracing::{debug, trace, warn};
use waypoint_balancer::{BalancerStats, LoadBalancer, LoadBalancerConfig};
use waypoint_breaker::{
    CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerMetrics, CircuitBreakerRegistry,
};
use waypoint_cache::{
    CacheConfig, CacheStats, CacheStrategy, DiscoveryCache, RefreshCallback, refresh_fn,
};
use waypoint_core::{
    BoxError, ConfigError, ConfigResult, LoadBalancingContext, ServiceInstance, ServiceQuery,
    service_of_key,
};

use crate::config::ResolverConfig;
use crate::error::{RegistryError, ResolutionError, ResolutionResult};
use crate::registry::ServiceRegistry;

/// Unreported selections remembered per instance for outcome routing.
const MAX_PENDING_SELECTIONS: usize = 1024;

/// Where a discovery answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    Cache,
    Registry,
}

/// Answer of [`ResolutionCoordinator::discover`].
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub instances: Vec<Arc<ServiceInstance>>,
    pub source: DiscoverySource,
    pub cached: bool,
    pub resolution_time: Duration,
}

impl DiscoveryResult {
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Coordinator counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub discoveries: u64,
    pub resolutions: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failures: u64,
    /// Resolutions that found no eligible instance
    pub empty_resolutions: u64,
    pub average_resolution_time_ms: f64,
}

impl CoordinatorStats {
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

/// Everything the resolver exposes for a metrics exporter.
#[derive(Debug, Clone, Serialize)]
pub struct ResolverStats {
    pub coordinator: CoordinatorStats,
    pub cache: CacheStats,
    pub circuit_breakers: Vec<CircuitBreakerMetrics>,
    /// Keyed by canonical query key
    pub load_balancers: BTreeMap<String, BalancerStats>,
}

#[derive(Debug, Default)]
struct Counters {
    discoveries: AtomicU64,
    resolutions: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failures: AtomicU64,
    empty_resolutions: AtomicU64,
    /// (samples, mean in ms)
    resolution_time: Mutex<(u64, f64)>,
}

impl Counters {
    fn record_resolution_time(&self, elapsed: Duration) {
        let mut guard = self.resolution_time.lock();
        let (samples, mean) = &mut *guard;
        *samples += 1;
        let ms = elapsed.as_secs_f64() * 1000.0;
        *mean += (ms - *mean) / *samples as f64;
    }
}

/// Registry lookups, optionally behind a per-service breaker.
///
/// Shared by the request path and by refresh-ahead callbacks.
#[derive(Clone)]
struct RegistryFetcher {
    registry: Arc<dyn ServiceRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    breaker_enabled: bool,
    timeout: Duration,
}

impl RegistryFetcher {
    async fn fetch(&self, query: &ServiceQuery) -> ResolutionResult<Vec<Arc<ServiceInstance>>> {
        let service = query.service_name.as_str();
        let lookup = || async move {
            match timeout(self.timeout, self.registry.list_instances(service)).await {
                Ok(Ok(instances)) => Ok(instances),
                // An unknown service has no instances; the registry is fine.
                Ok(Err(RegistryError::ServiceNotFound(_))) => Ok(Vec::new()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(RegistryError::Timeout(self.timeout)),
            }
        };

        let result = if self.breaker_enabled {
            let breaker = self.breakers.get_or_create(&format!("registry:{}", service));
            breaker.call(lookup).await.map_err(|e| match e {
                CircuitBreakerError::Open { name, state } => {
                    ResolutionError::CircuitOpen { target: name, state }
                }
                CircuitBreakerError::Execution(e) => ResolutionError::RegistryUnavailable(e),
            })
        } else {
            lookup().await.map_err(ResolutionError::from)
        };

        match result {
            Ok(instances) => Ok(instances.into_iter().filter(|i| query.matches(i)).collect()),
            Err(e) => {
                warn!(service = %service, error = %e, "Registry lookup failed");
                Err(e)
            }
        }
    }

    fn refresh_callback(&self, query: &ServiceQuery) -> RefreshCallback {
        let fetcher = self.clone();
        let query = query.clone();
        refresh_fn(move || {
            let fetcher = fetcher.clone();
            let query = query.clone();
            async move { fetcher.fetch(&query).await.map_err(|e| Box::new(e) as BoxError) }
        })
    }
}

/// Resolves a [`ServiceQuery`] to one instance.
///
/// Lookups go through the [`DiscoveryCache`]; misses hit the registry
/// behind a `registry:{service}` breaker. Candidates whose
/// `{service}:{instance_id}` breaker refuses requests are skipped, and the
/// rest are handed to a load balancer kept per query key. A half-open
/// instance is only chosen while it has a free trial slot. Callers report
/// how the chosen instance behaved through
/// [`record_outcome`](Self::record_outcome).
pub struct ResolutionCoordinator {
    config: ResolverConfig,
    fetcher: RegistryFetcher,
    cache: DiscoveryCache,
    breakers: Arc<CircuitBreakerRegistry>,
    /// Per query key, bounded like the cache
    balancers: Mutex<LruCache<String, Arc<LoadBalancer>>>,
    /// Keys of the balancers that picked an instance, oldest first
    selections: DashMap<String, VecDeque<String>>,
    counters: Counters,
}

impl ResolutionCoordinator {
    pub fn builder(registry: Arc<dyn ServiceRegistry>) -> ResolutionCoordinatorBuilder {
        ResolutionCoordinatorBuilder {
            registry,
            config: ResolverConfig::default(),
            breakers: None,
        }
    }

    /// Coordinator with the default configuration.
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> ConfigResult<Self> {
        Self::builder(registry).build()
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Instances matching `query`, from the cache when possible.
    ///
    /// The answer holds at most `query.max_instances` entries. Empty
    /// registry answers are not cached.
    pub async fn discover(&self, query: &ServiceQuery) -> ResolutionResult<DiscoveryResult> {
        let start = Instant::now();
        query.validate()?;
        self.counters.discoveries.fetch_add(1, Ordering::Relaxed);

        let refresh = self.fetcher.refresh_callback(query);
        if let Some(instances) = self.cache.get(query, Some(refresh)) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            trace!(service = %query.service_name, count = instances.len(), "Resolved from cache");
            return Ok(DiscoveryResult {
                instances: truncate(instances, query.max_instances),
                source: DiscoverySource::Cache,
                cached: true,
                resolution_time: start.elapsed(),
            });
        }
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        let instances = match self.fetcher.fetch(query).await {
            Ok(instances) => instances,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let cached =
            !instances.is_empty() && self.cache.config().strategy != CacheStrategy::None;
        if cached {
            self.cache.put(
                query,
                instances.clone(),
                Some(self.fetcher.refresh_callback(query)),
            );
        }
        debug!(
            service = %query.service_name,
            count = instances.len(),
            "Resolved from registry"
        );

        Ok(DiscoveryResult {
            instances: truncate(instances, query.max_instances),
            source: DiscoverySource::Registry,
            cached,
            resolution_time: start.elapsed(),
        })
    }

    /// Pick one instance for `query`, or `None` when nothing is eligible.
    ///
    /// A returned instance has a connection opened on it; report the
    /// request through [`record_outcome`](Self::record_outcome) to close it.
    pub async fn resolve(
        &self,
        query: &ServiceQuery,
        context: Option<&LoadBalancingContext>,
    ) -> ResolutionResult<Option<Arc<ServiceInstance>>> {
        let start = Instant::now();
        self.counters.resolutions.fetch_add(1, Ordering::Relaxed);

        let discovered = self.discover(query).await?;
        // Cached snapshots may predate a health change.
        let candidates: Vec<Arc<ServiceInstance>> = discovered
            .instances
            .into_iter()
            .filter(|i| query.matches(i) && self.instance_allowed(i))
            .collect();

        let selected = match &self.config.load_balancer {
            _ if candidates.is_empty() => None,
            Some(lb_config) => {
                let key = query.cache_key();
                let balancer = self.balancer_for(&key, lb_config)?;
                let selected = self.pick_admitted(candidates, |pool| {
                    balancer.update_instances(pool);
                    balancer.select_with_fallback(context)
                });
                if let Some(instance) = &selected {
                    self.remember_selection(instance, key);
                }
                selected
            }
            None => self.pick_admitted(candidates, |pool| self.preferred_pick(&pool)),
        };

        self.counters.record_resolution_time(start.elapsed());
        match &selected {
            Some(instance) => trace!(
                service = %query.service_name,
                instance = %instance.instance_id,
                "Resolved instance"
            ),
            None => {
                self.counters.empty_resolutions.fetch_add(1, Ordering::Relaxed);
                debug!(service = %query.service_name, "No eligible instance");
            }
        }
        Ok(selected)
    }

    fn instance_allowed(&self, instance: &ServiceInstance) -> bool {
        if !self.config.instance_breakers_enabled {
            return true;
        }
        self.breakers
            .get(&instance_key(instance))
            .is_none_or(|breaker| breaker.allows_requests())
    }

    /// Run `pick` until it returns an instance its breaker admits, dropping
    /// refused instances from the pool between attempts.
    fn pick_admitted<F>(
        &self,
        mut pool: Vec<Arc<ServiceInstance>>,
        mut pick: F,
    ) -> Option<Arc<ServiceInstance>>
    where
        F: FnMut(Vec<Arc<ServiceInstance>>) -> Option<Arc<ServiceInstance>>,
    {
        while !pool.is_empty() {
            let chosen = pick(pool.clone())?;
            if self.admit(&chosen) {
                return Some(chosen);
            }
            chosen.connection_closed();
            pool.retain(|i| i.instance_id != chosen.instance_id);
        }
        None
    }

    /// Take a trial slot when the instance breaker is half-open.
    fn admit(&self, instance: &ServiceInstance) -> bool {
        if !self.config.instance_breakers_enabled {
            return true;
        }
        let Some(breaker) = self.breakers.get(&instance_key(instance)) else {
            return true;
        };
        match breaker.try_acquire() {
            Ok(()) => true,
            Err(state) => {
                debug!(
                    instance = %instance.instance_id,
                    state = %state,
                    "Instance breaker refused selection, picking again"
                );
                false
            }
        }
    }

    fn balancer_for(&self, key: &str, config: &LoadBalancerConfig) -> ConfigResult<Arc<LoadBalancer>> {
        let mut balancers = self.balancers.lock();
        if let Some(balancer) = balancers.get(key) {
            return Ok(Arc::clone(balancer));
        }
        let balancer = Arc::new(LoadBalancer::new(config.clone())?);
        if let Some((evicted, _)) = balancers.push(key.to_string(), Arc::clone(&balancer)) {
            debug!(evicted = %evicted, "Evicted least recently used load balancer");
        }
        Ok(balancer)
    }

    fn remember_selection(&self, instance: &ServiceInstance, balancer_key: String) {
        let mut pending = self.selections.entry(instance_key(instance)).or_default();
        if pending.len() >= MAX_PENDING_SELECTIONS {
            pending.pop_front();
        }
        pending.push_back(balancer_key);
    }

    /// Random pick preferring the local zone, then the local region.
    fn preferred_pick(&self, candidates: &[Arc<ServiceInstance>]) -> Option<Arc<ServiceInstance>> {
        let zone = self.config.local_zone.as_deref();
        let region = self.config.local_region.as_deref();
        let in_zone: Vec<Arc<ServiceInstance>> = candidates
            .iter()
            .filter(|i| zone.is_some() && i.metadata.zone.as_deref() == zone)
            .cloned()
            .collect();
        let in_region: Vec<Arc<ServiceInstance>> = candidates
            .iter()
            .filter(|i| region.is_some() && i.metadata.region.as_deref() == region)
            .cloned()
            .collect();

        let pool = if !in_zone.is_empty() {
            in_zone
        } else if !in_region.is_empty() {
            in_region
        } else {
            candidates.to_vec()
        };

        let chosen = pool.choose(&mut rand::rng()).cloned()?;
        chosen.connection_opened();
        Some(chosen)
    }

    /// Report how a request to `instance` went.
    ///
    /// The request is credited to the balancer that selected the instance;
    /// other balancers holding it only feed their strategies. The
    /// instance's `{service}:{instance_id}` breaker records the outcome too.
    pub fn record_outcome(&self, instance: &ServiceInstance, success: bool, latency: Duration) {
        let key = instance_key(instance);
        let owner_key = self
            .selections
            .get_mut(&key)
            .and_then(|mut pending| pending.pop_front());
        self.selections.remove_if(&key, |_, pending| pending.is_empty());

        let (owner, others) = {
            let balancers = self.balancers.lock();
            let owner = owner_key.and_then(|k| balancers.peek(&k).cloned());
            let others: Vec<Arc<LoadBalancer>> = balancers
                .iter()
                .map(|(_, b)| b)
                .filter(|b| b.contains(&instance.instance_id))
                .filter(|b| owner.as_ref().is_none_or(|o| !Arc::ptr_eq(o, b)))
                .cloned()
                .collect();
            (owner, others)
        };

        let mut others = others.into_iter();
        match owner.or_else(|| others.next()) {
            Some(balancer) => balancer.record_request(instance, success, latency),
            None => instance.record_request(success, latency),
        }
        for balancer in others {
            balancer.observe(instance, success, latency);
        }

        if self.config.instance_breakers_enabled {
            let breaker = self
                .breakers
                .for_instance(&instance.service_name, &instance.instance_id);
            if success {
                breaker.record_success(latency);
            } else {
                breaker.record_failure(latency);
            }
        }
    }

    /// Drop cached answers and balancers of `service_name`; returns how
    /// many cache entries went.
    pub fn invalidate(&self, service_name: &str) -> usize {
        let removed = self.cache.invalidate(service_name);
        {
            let mut balancers = self.balancers.lock();
            let doomed: Vec<String> = balancers
                .iter()
                .map(|(key, _)| key)
                .filter(|key| service_of_key(key) == service_name)
                .cloned()
                .collect();
            for key in &doomed {
                balancers.pop(key);
            }
        }
        self.selections.retain(|_, pending| {
            pending.retain(|key| service_of_key(key) != service_name);
            !pending.is_empty()
        });
        debug!(service = %service_name, removed, "Invalidated service");
        removed
    }

    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.counters;
        CoordinatorStats {
            discoveries: c.discoveries.load(Ordering::Relaxed),
            resolutions: c.resolutions.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            empty_resolutions: c.empty_resolutions.load(Ordering::Relaxed),
            average_resolution_time_ms: c.resolution_time.lock().1,
        }
    }

    /// Snapshot of the coordinator and every component it owns.
    pub fn get_stats(&self) -> ResolverStats {
        ResolverStats {
            coordinator: self.stats(),
            cache: self.cache.stats(),
            circuit_breakers: self.breakers.all_metrics(),
            load_balancers: self
                .balancers
                .lock()
                .iter()
                .map(|(key, balancer)| (key.clone(), balancer.stats()))
                .collect(),
        }
    }

    /// Stop refresh-ahead work; `true` if it finished within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cache.shutdown(timeout).await
    }
}

impl std::fmt::Debug for ResolutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionCoordinator")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("balancers", &self.balancers.lock().len())
            .finish()
    }
}

fn instance_key(instance: &ServiceInstance) -> String {
    format!("{}:{}", instance.service_name, instance.instance_id)
}

fn truncate(mut instances: Vec<Arc<ServiceInstance>>, max: Option<usize>) -> Vec<Arc<ServiceInstance>> {
    if let Some(max) = max {
        instances.truncate(max);
    }
    instances
}

/// Builder for [`ResolutionCoordinator`].
pub struct ResolutionCoordinatorBuilder {
    registry: Arc<dyn ServiceRegistry>,
    config: ResolverConfig,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl ResolutionCoordinatorBuilder {
    pub fn config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn load_balancer(mut self, load_balancer: LoadBalancerConfig) -> Self {
        self.config.load_balancer = Some(load_balancer);
        self
    }

    /// Resolve with a zone/region-preferring random pick instead.
    pub fn without_load_balancer(mut self) -> Self {
        self.config.load_balancer = None;
        self
    }

    pub fn circuit_breaker(mut self, defaults: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = defaults;
        self
    }

    /// Share breakers with other components instead of creating a registry
    /// from the configured defaults.
    pub fn breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn local_zone(mut self, zone: impl Into<String>) -> Self {
        self.config.local_zone = Some(zone.into());
        self
    }

    pub fn local_region(mut self, region: impl Into<String>) -> Self {
        self.config.local_region = Some(region.into());
        self
    }

    pub fn build(self) -> ConfigResult<ResolutionCoordinator> {
        let config = self.config;
        config.validate()?;

        let breakers = match self.breakers {
            Some(breakers) => breakers,
            None => Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())?),
        };
        let cache = DiscoveryCache::new(config.cache.clone())?;
        let balancer_capacity = NonZeroUsize::new(config.cache.max_size)
            .ok_or_else(|| ConfigError::invalid("cache.max_size", "must be greater than zero"))?;
        let fetcher = RegistryFetcher {
            registry: self.registry,
            breakers: Arc::clone(&breakers),
            breaker_enabled: config.registry_breaker_enabled,
            timeout: config.registry_timeout,
        };

        Ok(ResolutionCoordinator {
            config,
            fetcher,
            cache,
            breakers,
            balancers: Mutex::new(LruCache::new(balancer_capacity)),
            selections: DashMap::new(),
            counters: Counters::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistry;
    use waypoint_balancer::LoadBalancingStrategy;
    use waypoint_breaker::CircuitState;
    use waypoint_core::{HealthStatus, InstanceMetadata, ServiceEndpoint};

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::new("orders", ServiceEndpoint::new("10.0.0.1", 8080)).with_id(id)
    }

    fn in_zone(id: &str, zone: &str, region: &str) -> ServiceInstance {
        instance(id).with_metadata(InstanceMetadata::new().with_zone(zone).with_region(region))
    }

    async fn registry_with(ids: &[&str]) -> InMemoryRegistry {
        let registry = InMemoryRegistry::new();
        for id in ids {
            registry.register(instance(id)).await;
        }
        registry
    }

    fn coordinator(registry: &InMemoryRegistry) -> ResolutionCoordinator {
        ResolutionCoordinator::builder(Arc::new(registry.clone()))
            .load_balancer(LoadBalancerConfig::new(LoadBalancingStrategy::RoundRobin))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_discover_caches_registry_answer() {
        let registry = registry_with(&["a", "b"]).await;
        let coordinator = coordinator(&registry);
        let query = ServiceQuery::new("orders");

        let first = coordinator.discover(&query).await.unwrap();
        assert_eq!(first.source, DiscoverySource::Registry);
        assert!(first.cached);
        assert_eq!(first.instances.len(), 2);

        let second = coordinator.discover(&query).await.unwrap();
        assert_eq!(second.source, DiscoverySource::Cache);
        assert_eq!(registry.call_count(), 1);

        let stats = coordinator.stats();
        assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));
        assert_eq!(stats.cache_hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_discover_filters_and_truncates() {
        let registry = registry_with(&["a", "b", "c"]).await;
        registry.set_health("b", HealthStatus::Unhealthy).await.unwrap();
        let coordinator = coordinator(&registry);

        let healthy = coordinator.discover(&ServiceQuery::new("orders")).await.unwrap();
        assert_eq!(healthy.instances.len(), 2);
        assert!(healthy.instances.iter().all(|i| i.instance_id != "b"));

        let everything = coordinator
            .discover(&ServiceQuery::new("orders").include_unhealthy(true).with_max_instances(2))
            .await
            .unwrap();
        assert_eq!(everything.instances.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_query_is_rejected() {
        let coordinator = coordinator(&InMemoryRegistry::new());
        let err = coordinator.discover(&ServiceQuery::new("")).await.unwrap_err();
        assert!(matches!(err, ResolutionError::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_service_resolves_to_none() {
        let registry = InMemoryRegistry::new();
        let coordinator = coordinator(&registry);
        let query = ServiceQuery::new("payments");

        assert!(coordinator.resolve(&query, None).await.unwrap().is_none());
        // Empty answers are not cached.
        assert!(coordinator.resolve(&query, None).await.unwrap().is_none());
        assert_eq!(registry.call_count(), 2);
        assert_eq!(coordinator.stats().empty_resolutions, 2);
        assert_eq!(coordinator.stats().failures, 0);
    }

    #[tokio::test]
    async fn test_registry_breaker_opens() {
        let registry = registry_with(&["a"]).await;
        registry.set_unavailable(true);
        let coordinator = ResolutionCoordinator::builder(Arc::new(registry.clone()))
            .circuit_breaker(
                CircuitBreakerConfig::default()
                    .failure_threshold(2)
                    .recovery_timeout(Duration::from_secs(60)),
            )
            .build()
            .unwrap();
        let query = ServiceQuery::new("orders");

        for _ in 0..2 {
            let err = coordinator.resolve(&query, None).await.unwrap_err();
            assert!(matches!(
                err,
                ResolutionError::RegistryUnavailable(RegistryError::Unavailable(_))
            ));
        }

        let err = coordinator.resolve(&query, None).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(registry.call_count(), 2);
        assert_eq!(coordinator.stats().failures, 3);

        let breaker = coordinator.breakers().get("registry:orders").unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_timeout() {
        let registry = registry_with(&["a"]).await;
        registry.set_delay(Some(Duration::from_secs(10)));
        let config = ResolverConfig {
            registry_timeout: Duration::from_millis(200),
            registry_breaker_enabled: false,
            ..ResolverConfig::default()
        };
        let coordinator = ResolutionCoordinator::builder(Arc::new(registry.clone()))
            .config(config)
            .build()
            .unwrap();

        let err = coordinator.discover(&ServiceQuery::new("orders")).await.unwrap_err();
        assert!(matches!(
            err,
            ResolutionError::RegistryUnavailable(RegistryError::Timeout(t)) if t == Duration::from_millis(200)
        ));
    }

    #[tokio::test]
    async fn test_round_robin_across_resolutions() {
        let registry = registry_with(&["a", "b"]).await;
        let coordinator = coordinator(&registry);
        let query = ServiceQuery::new("orders");

        let mut picks = Vec::new();
        for _ in 0..4 {
            let instance = coordinator.resolve(&query, None).await.unwrap().unwrap();
            coordinator.record_outcome(&instance, true, Duration::from_millis(5));
            picks.push(instance.instance_id.clone());
        }
        assert_eq!(picks, ["a", "b", "a", "b"]);

        let stats = coordinator.get_stats();
        let balancer = stats.load_balancers.get(&query.cache_key()).unwrap();
        assert_eq!(balancer.total_requests, 4);
        assert!(balancer.instances.iter().all(|i| i.active_connections == 0));
    }

    #[tokio::test]
    async fn test_failing_instance_is_skipped() {
        let registry = registry_with(&["a", "b"]).await;
        let coordinator = ResolutionCoordinator::builder(Arc::new(registry.clone()))
            .load_balancer(LoadBalancerConfig::new(LoadBalancingStrategy::RoundRobin))
            .circuit_breaker(
                CircuitBreakerConfig::default()
                    .failure_threshold(2)
                    .recovery_timeout(Duration::from_secs(60)),
            )
            .build()
            .unwrap();
        let a = registry.get("a").await.unwrap();

        coordinator.record_outcome(&a, false, Duration::from_millis(5));
        coordinator.record_outcome(&a, false, Duration::from_millis(5));
        assert_eq!(
            coordinator.breakers().get("orders:a").unwrap().state(),
            CircuitState::Open
        );

        let query = ServiceQuery::new("orders");
        for _ in 0..3 {
            let pick = coordinator.resolve(&query, None).await.unwrap().unwrap();
            assert_eq!(pick.instance_id, "b");
        }
        assert_eq!(a.total_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_instance_gets_limited_trials() {
        let registry = registry_with(&["a", "b"]).await;
        let coordinator = ResolutionCoordinator::builder(Arc::new(registry.clone()))
            .load_balancer(LoadBalancerConfig::new(LoadBalancingStrategy::RoundRobin))
            .circuit_breaker(
                CircuitBreakerConfig::default()
                    .failure_threshold(1)
                    .recovery_timeout(Duration::from_secs(1))
                    .exponential_backoff(false)
                    .success_threshold(2)
                    .half_open_max_calls(2),
            )
            .build()
            .unwrap();
        let a = registry.get("a").await.unwrap();
        coordinator.record_outcome(&a, false, Duration::from_millis(5));
        tokio::time::advance(Duration::from_secs(1)).await;

        let query = ServiceQuery::new("orders");
        let mut trials = 0;
        for _ in 0..20 {
            let pick = coordinator.resolve(&query, None).await.unwrap().unwrap();
            if pick.instance_id == "a" {
                trials += 1;
            }
        }
        assert_eq!(trials, 2);
        assert_eq!(a.active_connections(), 2);
        let breaker = coordinator.breakers().get("orders:a").unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_label_values_with_delimiters_do_not_alias() {
        let registry = InMemoryRegistry::new();
        registry
            .register(instance("packed").with_metadata(InstanceMetadata::new().with_label("a", "b,c=d")))
            .await;
        registry
            .register(
                instance("split")
                    .with_metadata(InstanceMetadata::new().with_label("a", "b").with_label("c", "d")),
            )
            .await;
        let coordinator = coordinator(&registry);
        let ids = |result: &DiscoveryResult| -> Vec<String> {
            result.instances.iter().map(|i| i.instance_id.clone()).collect()
        };

        let packed = ServiceQuery::new("orders").with_label("a", "b,c=d");
        let split = ServiceQuery::new("orders").with_label("a", "b").with_label("c", "d");
        assert_eq!(ids(&coordinator.discover(&packed).await.unwrap()), ["packed"]);

        let second = coordinator.discover(&split).await.unwrap();
        assert_eq!(second.source, DiscoverySource::Registry);
        assert_eq!(ids(&second), ["split"]);
        assert_eq!(coordinator.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_outcome_credited_to_selecting_balancer() {
        let registry = registry_with(&["a"]).await;
        let coordinator = coordinator(&registry);
        let healthy = ServiceQuery::new("orders");
        let everything = ServiceQuery::new("orders").include_unhealthy(true);

        let pick = coordinator.resolve(&healthy, None).await.unwrap().unwrap();
        coordinator.record_outcome(&pick, true, Duration::from_millis(1));
        for _ in 0..3 {
            let pick = coordinator.resolve(&everything, None).await.unwrap().unwrap();
            coordinator.record_outcome(&pick, false, Duration::from_millis(1));
        }

        let stats = coordinator.get_stats();
        let first = &stats.load_balancers[&healthy.cache_key()];
        let second = &stats.load_balancers[&everything.cache_key()];
        assert_eq!((first.total_requests, first.total_failures), (1, 0));
        assert_eq!((second.total_requests, second.total_failures), (3, 3));
        assert_eq!(registry.get("a").await.unwrap().total_requests(), 4);
    }

    #[tokio::test]
    async fn test_balancers_bounded_by_cache_size() {
        let registry = registry_with(&["a", "b", "c", "d"]).await;
        let coordinator = ResolutionCoordinator::builder(Arc::new(registry.clone()))
            .load_balancer(LoadBalancerConfig::new(LoadBalancingStrategy::RoundRobin))
            .cache(CacheConfig::new().with_max_size(2))
            .build()
            .unwrap();

        for id in ["a", "b", "c", "d"] {
            let query = ServiceQuery::new("orders").exclude(id);
            let pick = coordinator.resolve(&query, None).await.unwrap().unwrap();
            coordinator.record_outcome(&pick, true, Duration::from_millis(1));
        }

        let stats = coordinator.get_stats();
        assert_eq!(stats.load_balancers.len(), 2);
        assert!(stats
            .load_balancers
            .contains_key(&ServiceQuery::new("orders").exclude("d").cache_key()));
        assert_eq!(stats.cache.size, 2);
        assert_eq!(stats.coordinator.resolutions, 4);
    }

    #[tokio::test]
    async fn test_preferred_pick_without_balancer() {
        let registry = InMemoryRegistry::new();
        registry.register(in_zone("far", "us-east-1a", "us-east-1")).await;
        registry.register(in_zone("near", "eu-west-1b", "eu-west-1")).await;
        registry.register(in_zone("local", "eu-west-1a", "eu-west-1")).await;

        let zoned = ResolutionCoordinator::builder(Arc::new(registry.clone()))
            .without_load_balancer()
            .local_zone("eu-west-1a")
            .local_region("eu-west-1")
            .build()
            .unwrap();
        let query = ServiceQuery::new("orders");
        for _ in 0..10 {
            let pick = zoned.resolve(&query, None).await.unwrap().unwrap();
            assert_eq!(pick.instance_id, "local");
        }

        let regional = ResolutionCoordinator::builder(Arc::new(registry.clone()))
            .without_load_balancer()
            .local_zone("eu-west-1c")
            .local_region("eu-west-1")
            .build()
            .unwrap();
        for _ in 0..10 {
            let pick = regional.resolve(&query, None).await.unwrap().unwrap();
            assert_ne!(pick.instance_id, "far");
            regional.record_outcome(&pick, true, Duration::from_millis(1));
        }
        assert!(regional.get_stats().load_balancers.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_forces_registry_lookup() {
        let registry = registry_with(&["a"]).await;
        let coordinator = coordinator(&registry);
        let query = ServiceQuery::new("orders");

        coordinator.resolve(&query, None).await.unwrap();
        registry.register(instance("b")).await;
        assert_eq!(coordinator.discover(&query).await.unwrap().instances.len(), 1);

        assert_eq!(coordinator.invalidate("orders"), 1);
        assert!(coordinator.get_stats().load_balancers.is_empty());
        let fresh = coordinator.discover(&query).await.unwrap();
        assert_eq!(fresh.source, DiscoverySource::Registry);
        assert_eq!(fresh.instances.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_ahead_goes_to_registry() {
        let registry = registry_with(&["a"]).await;
        let coordinator = ResolutionCoordinator::builder(Arc::new(registry.clone()))
            .cache(
                CacheConfig::new()
                    .with_strategy(CacheStrategy::RefreshAhead)
                    .with_ttl(Duration::from_millis(100))
                    .with_refresh_ahead_factor(0.5),
            )
            .build()
            .unwrap();
        let query = ServiceQuery::new("orders");

        coordinator.discover(&query).await.unwrap();
        registry.register(instance("b")).await;
        tokio::time::advance(Duration::from_millis(60)).await;

        let stale = coordinator.discover(&query).await.unwrap();
        assert_eq!(stale.source, DiscoverySource::Cache);
        assert_eq!(stale.instances.len(), 1);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(registry.call_count(), 2);
        let refreshed = coordinator.discover(&query).await.unwrap();
        assert_eq!(refreshed.source, DiscoverySource::Cache);
        assert_eq!(refreshed.instances.len(), 2);

        assert!(coordinator.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_cache_disabled() {
        let registry = registry_with(&["a"]).await;
        let coordinator = ResolutionCoordinator::builder(Arc::new(registry.clone()))
            .cache(CacheConfig::new().with_strategy(CacheStrategy::None))
            .build()
            .unwrap();
        let query = ServiceQuery::new("orders");

        let first = coordinator.discover(&query).await.unwrap();
        assert!(!first.cached);
        assert_eq!(
            coordinator.discover(&query).await.unwrap().source,
            DiscoverySource::Registry
        );
        assert_eq!(registry.call_count(), 2);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = ResolverConfig {
            registry_timeout: Duration::ZERO,
            ..ResolverConfig::default()
        };
        let result = ResolutionCoordinator::builder(Arc::new(InMemoryRegistry::new()))
            .config(config)
            .build();
        assert!(result.is_err());
    }
}

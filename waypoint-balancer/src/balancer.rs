//! Candidate pool plus primary and fallback strategies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};
use waypoint_core::{ConfigResult, HealthStatus, LoadBalancingContext, ServiceInstance};

use crate::config::{LoadBalancerConfig, LoadBalancingStrategy};
use crate::strategies::{SelectionStrategy, create_strategy};

type Pool = Arc<Vec<Arc<ServiceInstance>>>;

/// Selects one instance per request from a replaceable candidate pool.
///
/// `update_instances` swaps the pool atomically; a selection already in
/// progress keeps the snapshot it started with. A successful selection
/// opens a connection on the chosen instance and `record_request` closes
/// it again.
#[derive(Debug)]
pub struct LoadBalancer {
    config: LoadBalancerConfig,
    pool: RwLock<Pool>,
    primary: Box<dyn SelectionStrategy>,
    fallback: Option<Box<dyn SelectionStrategy>>,
    stats: BalancerCounters,
}

#[derive(Debug, Default)]
struct BalancerCounters {
    selections: AtomicU64,
    fallback_selections: AtomicU64,
    empty_selections: AtomicU64,
    requests: AtomicU64,
    failures: AtomicU64,
    pool_updates: AtomicU64,
    per_instance: DashMap<String, u64>,
}

/// Snapshot of one pool member.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub instance_id: String,
    pub health: HealthStatus,
    pub selections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub average_latency_ms: Option<f64>,
    pub effective_weight: f64,
}

/// Snapshot of a balancer.
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub strategy: LoadBalancingStrategy,
    pub fallback_strategy: Option<LoadBalancingStrategy>,
    pub pool_size: usize,
    pub available_instances: usize,
    pub total_selections: u64,
    /// Selections served by the fallback strategy
    pub fallback_selections: u64,
    /// Selection attempts that yielded nothing
    pub empty_selections: u64,
    pub total_requests: u64,
    pub total_failures: u64,
    pub pool_updates: u64,
    pub instances: Vec<InstanceStats>,
}

impl BalancerStats {
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_requests as f64
        }
    }
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig) -> ConfigResult<Self> {
        config.validate()?;
        let primary = create_strategy(config.strategy, &config);
        let fallback = config
            .fallback_strategy
            .map(|kind| create_strategy(kind, &config));
        Ok(Self {
            config,
            pool: RwLock::new(Arc::new(Vec::new())),
            primary,
            fallback,
            stats: BalancerCounters::default(),
        })
    }

    pub fn with_strategy(strategy: LoadBalancingStrategy) -> ConfigResult<Self> {
        Self::new(LoadBalancerConfig::new(strategy))
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.primary.kind()
    }

    /// Replace the candidate pool.
    pub fn update_instances(&self, instances: Vec<Arc<ServiceInstance>>) {
        let pool: Pool = Arc::new(instances);
        self.primary.on_pool_update(&pool);
        if let Some(fallback) = &self.fallback {
            fallback.on_pool_update(&pool);
        }
        self.stats
            .per_instance
            .retain(|id, _| pool.iter().any(|i| &i.instance_id == id));
        debug!(
            strategy = %self.primary.kind(),
            instances = pool.len(),
            "Load balancer pool updated"
        );
        *self.pool.write() = pool;
        self.stats.pool_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Current pool snapshot.
    pub fn instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.snapshot().to_vec()
    }

    /// Whether `instance_id` is in the current pool.
    pub fn contains(&self, instance_id: &str) -> bool {
        self.pool.read().iter().any(|i| i.instance_id == instance_id)
    }

    fn snapshot(&self) -> Pool {
        Arc::clone(&self.pool.read())
    }

    /// Select with the primary strategy only.
    pub fn select_instance(
        &self,
        context: Option<&LoadBalancingContext>,
    ) -> Option<Arc<ServiceInstance>> {
        let pool = self.snapshot();
        match self.primary.select(&pool, context) {
            Some(instance) => Some(self.selected(instance, false)),
            None => {
                self.stats.empty_selections.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Select with the primary strategy, then the fallback strategy if the
    /// primary yields nothing.
    pub fn select_with_fallback(
        &self,
        context: Option<&LoadBalancingContext>,
    ) -> Option<Arc<ServiceInstance>> {
        let pool = self.snapshot();
        if let Some(instance) = self.primary.select(&pool, context) {
            return Some(self.selected(instance, false));
        }
        if let Some(fallback) = &self.fallback
            && let Some(instance) = fallback.select(&pool, context)
        {
            debug!(
                primary = %self.primary.kind(),
                fallback = %fallback.kind(),
                instance = %instance.instance_id,
                "Primary strategy yielded nothing, used fallback"
            );
            return Some(self.selected(instance, true));
        }
        self.stats.empty_selections.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn selected(&self, instance: Arc<ServiceInstance>, via_fallback: bool) -> Arc<ServiceInstance> {
        instance.connection_opened();
        self.stats.selections.fetch_add(1, Ordering::Relaxed);
        if via_fallback {
            self.stats.fallback_selections.fetch_add(1, Ordering::Relaxed);
        }
        *self
            .stats
            .per_instance
            .entry(instance.instance_id.clone())
            .or_insert(0) += 1;
        trace!(instance = %instance.instance_id, "Instance selected");
        instance
    }

    /// Report the outcome of a request served by `instance`.
    ///
    /// Updates the instance's own counters (closing the connection opened
    /// by selection) and every strategy's internal tracking.
    pub fn record_request(&self, instance: &ServiceInstance, success: bool, latency: Duration) {
        instance.record_request(success, latency);
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.observe(instance, success, latency);
    }

    /// Feed strategy-internal tracking only; instance counters are left
    /// alone. Used when several balancers share an instance and another
    /// one already recorded the request.
    pub fn observe(&self, instance: &ServiceInstance, success: bool, latency: Duration) {
        self.primary.observe(instance, success, latency);
        if let Some(fallback) = &self.fallback {
            fallback.observe(instance, success, latency);
        }
    }

    pub fn stats(&self) -> BalancerStats {
        let pool = self.snapshot();
        let instances = pool
            .iter()
            .map(|i| InstanceStats {
                instance_id: i.instance_id.clone(),
                health: i.health(),
                selections: self
                    .stats
                    .per_instance
                    .get(&i.instance_id)
                    .map(|n| *n.value())
                    .unwrap_or(0),
                active_connections: i.active_connections(),
                total_requests: i.total_requests(),
                total_failures: i.total_failures(),
                success_rate: i.success_rate(),
                average_latency_ms: i.average_latency_ms(),
                effective_weight: i.effective_weight(),
            })
            .collect();

        BalancerStats {
            strategy: self.primary.kind(),
            fallback_strategy: self.fallback.as_ref().map(|f| f.kind()),
            pool_size: pool.len(),
            available_instances: pool.iter().filter(|i| i.is_available()).count(),
            total_selections: self.stats.selections.load(Ordering::Relaxed),
            fallback_selections: self.stats.fallback_selections.load(Ordering::Relaxed),
            empty_selections: self.stats.empty_selections.load(Ordering::Relaxed),
            total_requests: self.stats.requests.load(Ordering::Relaxed),
            total_failures: self.stats.failures.load(Ordering::Relaxed),
            pool_updates: self.stats.pool_updates.load(Ordering::Relaxed),
            instances,
        }
    }
}

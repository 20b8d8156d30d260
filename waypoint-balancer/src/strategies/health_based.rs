use std::sync::Arc;
use std::time::Duration;

use waypoint_core::{LoadBalancingContext, ServiceInstance};

use super::SelectionStrategy;
use crate::config::LoadBalancingStrategy;

/// Restricts the pool to `Healthy` instances and hands the rest to a
/// delegate. `Warning` instances are excluded here even though generic
/// strategies accept them.
#[derive(Debug)]
pub struct HealthBased {
    delegate: Box<dyn SelectionStrategy>,
}

impl HealthBased {
    pub fn new(delegate: Box<dyn SelectionStrategy>) -> Self {
        Self { delegate }
    }

    pub fn delegate_kind(&self) -> LoadBalancingStrategy {
        self.delegate.kind()
    }

    fn healthy(pool: &[Arc<ServiceInstance>]) -> Vec<Arc<ServiceInstance>> {
        pool.iter().filter(|i| i.is_healthy()).cloned().collect()
    }
}

impl SelectionStrategy for HealthBased {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::HealthBased
    }

    fn select(
        &self,
        pool: &[Arc<ServiceInstance>],
        context: Option<&LoadBalancingContext>,
    ) -> Option<Arc<ServiceInstance>> {
        let healthy = Self::healthy(pool);
        if healthy.is_empty() {
            return None;
        }
        self.delegate.select(&healthy, context)
    }

    fn on_pool_update(&self, pool: &[Arc<ServiceInstance>]) {
        self.delegate.on_pool_update(&Self::healthy(pool));
    }

    fn observe(&self, instance: &ServiceInstance, success: bool, latency: Duration) {
        self.delegate.observe(instance, success, latency);
    }
}

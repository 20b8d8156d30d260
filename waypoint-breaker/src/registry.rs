//! Named collection of circuit breakers sharing one default configuration.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use waypoint_core::ConfigResult;

use crate::breaker::{CircuitBreaker, CircuitBreakerMetrics};
use crate::config::CircuitBreakerConfig;

/// Owns the breakers of one resolver.
///
/// Created once and handed to whoever needs breakers; independent
/// registries never share state.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerConfig) -> ConfigResult<Self> {
        defaults.validate()?;
        Ok(Self {
            defaults,
            breakers: DashMap::new(),
        })
    }

    pub fn defaults(&self) -> &CircuitBreakerConfig {
        &self.defaults
    }

    /// Breaker called `name`, created from the defaults on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(name = %name, "Creating circuit breaker");
            CircuitBreaker::from_validated(self.defaults.named(name))
        });
        Arc::clone(entry.value())
    }

    /// Breaker called `name` with its own configuration. An existing
    /// breaker of that name is returned unchanged.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> ConfigResult<Arc<CircuitBreaker>> {
        if let Some(existing) = self.breakers.get(name) {
            return Ok(Arc::clone(existing.value()));
        }
        let config = config.named(name);
        config.validate()?;
        let entry = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::from_validated(config));
        Ok(Arc::clone(entry.value()))
    }

    /// Breaker guarding one instance, named `{service}:{instance_id}`.
    pub fn for_instance(&self, service: &str, instance_id: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(&format!("{}:{}", service, instance_id))
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, b)| b)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Metrics of every breaker, sorted by name.
    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|b| Arc::clone(b.value())).collect();
        let mut metrics: Vec<CircuitBreakerMetrics> = breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|b| Arc::clone(b.value())).collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}

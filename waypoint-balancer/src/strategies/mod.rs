//! Instance selection strategies
//!
//! Every strategy implements [`SelectionStrategy`] and is built through
//! [`create_strategy`]:
//!
//! - **Round robin** / **weighted round robin**: deterministic rotation
//! - **Least connections** / **weighted least connections**: fewest in flight
//! - **Random** / **weighted random**: sampled picks
//! - **Consistent hash** / **IP hash**: sticky, keyed by the request context
//! - **Health based**: healthy subset, then a delegate
//! - **Adaptive**: EWMA of latency and error rate per instance

mod adaptive;
mod consistent_hash;
mod health_based;
mod ip_hash;
mod least_connections;
mod random;
mod round_robin;
mod weighted_round_robin;

pub use adaptive::Adaptive;
pub use consistent_hash::ConsistentHash;
pub use health_based::HealthBased;
pub use ip_hash::IpHash;
pub use least_connections::LeastConnections;
pub use random::Random;
pub use round_robin::RoundRobin;
pub use weighted_round_robin::WeightedRoundRobin;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use waypoint_core::{LoadBalancingContext, ServiceInstance};

use crate::config::{LoadBalancerConfig, LoadBalancingStrategy};

/// Narrow contract shared by every selection strategy.
///
/// `select` receives the pool snapshot taken at the start of the call, so a
/// concurrent pool replacement never affects a selection already running.
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> LoadBalancingStrategy;

    fn select(
        &self,
        pool: &[Arc<ServiceInstance>],
        context: Option<&LoadBalancingContext>,
    ) -> Option<Arc<ServiceInstance>>;

    /// Called after the candidate pool was replaced.
    fn on_pool_update(&self, _pool: &[Arc<ServiceInstance>]) {}

    /// Outcome of a request served by `instance`.
    fn observe(&self, _instance: &ServiceInstance, _success: bool, _latency: Duration) {}
}

/// Build the strategy for `kind`.
pub fn create_strategy(
    kind: LoadBalancingStrategy,
    config: &LoadBalancerConfig,
) -> Box<dyn SelectionStrategy> {
    match kind {
        LoadBalancingStrategy::RoundRobin => Box::new(RoundRobin::new()),
        LoadBalancingStrategy::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
        LoadBalancingStrategy::LeastConnections => Box::new(LeastConnections::new()),
        LoadBalancingStrategy::WeightedLeastConnections => Box::new(LeastConnections::weighted()),
        LoadBalancingStrategy::Random => Box::new(Random::new()),
        LoadBalancingStrategy::WeightedRandom => Box::new(Random::weighted()),
        LoadBalancingStrategy::ConsistentHash => {
            Box::new(ConsistentHash::new(config.virtual_nodes))
        }
        LoadBalancingStrategy::IpHash => Box::new(IpHash::new()),
        LoadBalancingStrategy::HealthBased => {
            // A self-delegating config is rejected by `validate`; round robin
            // keeps this total for unvalidated callers.
            let delegate = match config.health_based_delegate {
                LoadBalancingStrategy::HealthBased => LoadBalancingStrategy::RoundRobin,
                other => other,
            };
            Box::new(HealthBased::new(create_strategy(delegate, config)))
        }
        LoadBalancingStrategy::Adaptive => Box::new(Adaptive::new(
            config.adaptive_alpha(),
            config.adaptive_exploration,
        )),
    }
}

/// Instances a generic strategy may pick from.
pub(crate) fn available(pool: &[Arc<ServiceInstance>]) -> Vec<&Arc<ServiceInstance>> {
    pool.iter().filter(|i| i.is_available()).collect()
}

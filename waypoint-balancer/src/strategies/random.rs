use std::sync::Arc;

use rand::Rng;
use waypoint_core::{LoadBalancingContext, ServiceInstance};

use super::{SelectionStrategy, available};
use crate::config::LoadBalancingStrategy;

/// Uniform random pick, or proportional to effective weight when weighted.
#[derive(Debug, Default)]
pub struct Random {
    weighted: bool,
}

impl Random {
    pub fn new() -> Self {
        Self { weighted: false }
    }

    pub fn weighted() -> Self {
        Self { weighted: true }
    }
}

impl SelectionStrategy for Random {
    fn kind(&self) -> LoadBalancingStrategy {
        if self.weighted {
            LoadBalancingStrategy::WeightedRandom
        } else {
            LoadBalancingStrategy::Random
        }
    }

    fn select(
        &self,
        pool: &[Arc<ServiceInstance>],
        _context: Option<&LoadBalancingContext>,
    ) -> Option<Arc<ServiceInstance>> {
        let eligible = available(pool);
        if eligible.is_empty() {
            return None;
        }
        let mut rng = rand::rng();

        if !self.weighted {
            let index = rng.random_range(0..eligible.len());
            return Some(Arc::clone(eligible[index]));
        }

        let weights: Vec<f64> = eligible.iter().map(|i| i.effective_weight()).collect();
        let total: f64 = weights.iter().sum();
        let mut threshold = rng.random::<f64>() * total;
        for (instance, weight) in eligible.iter().zip(&weights) {
            if threshold < *weight {
                return Some(Arc::clone(instance));
            }
            threshold -= weight;
        }
        // Rounding can leave a sliver past the last bucket.
        eligible.last().map(|i| Arc::clone(i))
    }
}

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use waypoint_core::{LoadBalancingContext, ServiceInstance};

use super::{SelectionStrategy, available};
use crate::config::LoadBalancingStrategy;

const MIN_SUCCESS_SCORE: f64 = 0.01;
const MIN_LATENCY_MS: f64 = 1.0;

/// Exponentially weighted view of one instance's recent requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceScore {
    pub latency_ms: f64,
    pub error_rate: f64,
    pub samples: u64,
}

impl PerformanceScore {
    fn first(success: bool, latency_ms: f64) -> Self {
        Self {
            latency_ms,
            error_rate: if success { 0.0 } else { 1.0 },
            samples: 1,
        }
    }

    fn update(&mut self, alpha: f64, success: bool, latency_ms: f64) {
        let error = if success { 0.0 } else { 1.0 };
        self.latency_ms += alpha * (latency_ms - self.latency_ms);
        self.error_rate += alpha * (error - self.error_rate);
        self.samples += 1;
    }

    /// Selection weight: high for fast and reliable instances.
    pub fn weight(&self) -> f64 {
        (1.0 - self.error_rate).max(MIN_SUCCESS_SCORE) / self.latency_ms.max(MIN_LATENCY_MS)
    }
}

/// Biases selection toward instances with low recent latency and errors.
///
/// Each pick is weighted by [`PerformanceScore::weight`]; instances without
/// samples borrow the best known weight so new members get traffic. A
/// fixed `exploration` share is spread uniformly, which keeps every
/// available instance in rotation and lets a recovered one win back load.
#[derive(Debug)]
pub struct Adaptive {
    alpha: f64,
    exploration: f64,
    scores: DashMap<String, PerformanceScore>,
}

impl Adaptive {
    pub fn new(alpha: f64, exploration: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            exploration: exploration.clamp(0.0, 1.0),
            scores: DashMap::new(),
        }
    }

    pub fn score(&self, instance_id: &str) -> Option<PerformanceScore> {
        self.scores.get(instance_id).map(|s| *s.value())
    }

    fn weights(&self, eligible: &[&Arc<ServiceInstance>]) -> Vec<f64> {
        let known: Vec<Option<f64>> = eligible
            .iter()
            .map(|i| self.score(&i.instance_id).map(|s| s.weight()))
            .collect();
        let best = known.iter().flatten().copied().fold(None, |acc: Option<f64>, w| {
            Some(acc.map_or(w, |a| a.max(w)))
        });
        known
            .into_iter()
            .map(|w| w.or(best).unwrap_or(1.0))
            .collect()
    }
}

impl SelectionStrategy for Adaptive {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::Adaptive
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

        let weights = self.weights(&eligible);
        let total: f64 = weights.iter().sum();
        let n = eligible.len() as f64;

        let mut threshold = rand::rng().random::<f64>();
        for (instance, weight) in eligible.iter().zip(&weights) {
            let p = (1.0 - self.exploration) * weight / total + self.exploration / n;
            if threshold < p {
                return Some(Arc::clone(instance));
            }
            threshold -= p;
        }
        eligible.last().map(|i| Arc::clone(i))
    }

    fn on_pool_update(&self, pool: &[Arc<ServiceInstance>]) {
        self.scores
            .retain(|id, _| pool.iter().any(|i| &i.instance_id == id));
    }

    fn observe(&self, instance: &ServiceInstance, success: bool, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.scores
            .entry(instance.instance_id.clone())
            .and_modify(|score| score.update(self.alpha, success, latency_ms))
            .or_insert_with(|| PerformanceScore::first(success, latency_ms));
    }
}

use std::sync::Arc;

use parking_lot::Mutex;
use waypoint_core::{LoadBalancingContext, ServiceInstance};

use super::{SelectionStrategy, available};
use crate::config::LoadBalancingStrategy;

/// Smooth weighted round robin.
///
/// Each pick adds every weight to a running score, takes the highest score
/// and subtracts the total weight from it. Every instance appears exactly
/// `weight` times per cycle, interleaved: weights 5:1:1 yield
/// `a a b a c a a` rather than a burst of five `a`s. A pick costs O(n)
/// whatever the weights. Instances with weight 0 are never selected.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    state: Mutex<Scores>,
}

#[derive(Debug, Default)]
struct Scores {
    /// `(instance_id, weight)` of the pool the scores belong to
    signature: Vec<(String, u32)>,
    current: Vec<i64>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scores {
    fn next(&mut self) -> usize {
        let total: i64 = self.signature.iter().map(|(_, w)| *w as i64).sum();
        let mut best = 0;
        for (i, (_, weight)) in self.signature.iter().enumerate() {
            self.current[i] += *weight as i64;
            if self.current[i] > self.current[best] {
                best = i;
            }
        }
        self.current[best] -= total;
        best
    }
}

impl SelectionStrategy for WeightedRoundRobin {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::WeightedRoundRobin
    }

    fn select(
        &self,
        pool: &[Arc<ServiceInstance>],
        _context: Option<&LoadBalancingContext>,
    ) -> Option<Arc<ServiceInstance>> {
        let eligible: Vec<&Arc<ServiceInstance>> = available(pool)
            .into_iter()
            .filter(|i| i.metadata.weight > 0)
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let signature: Vec<(String, u32)> = eligible
            .iter()
            .map(|i| (i.instance_id.clone(), i.metadata.weight))
            .collect();

        let mut scores = self.state.lock();
        if scores.signature != signature {
            scores.current = vec![0; signature.len()];
            scores.signature = signature;
        }
        let index = scores.next();
        Some(Arc::clone(eligible[index]))
    }
}

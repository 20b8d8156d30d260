use std::cmp::Ordering;
use std::sync::Arc;

use waypoint_core::{LoadBalancingContext, ServiceInstance};

use super::{SelectionStrategy, available};
use crate::config::LoadBalancingStrategy;

/// Picks the available instance with the fewest active connections.
///
/// Ties go to the earliest instance in pool order; the weighted variant
/// first prefers the higher effective weight.
#[derive(Debug, Default)]
pub struct LeastConnections {
    weighted: bool,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self { weighted: false }
    }

    pub fn weighted() -> Self {
        Self { weighted: true }
    }

    fn compare(&self, a: &ServiceInstance, b: &ServiceInstance) -> Ordering {
        let by_connections = a.active_connections().cmp(&b.active_connections());
        if !self.weighted {
            return by_connections;
        }
        // Higher weight sorts first.
        by_connections.then_with(|| {
            b.effective_weight()
                .partial_cmp(&a.effective_weight())
                .unwrap_or(Ordering::Equal)
        })
    }
}

impl SelectionStrategy for LeastConnections {
    fn kind(&self) -> LoadBalancingStrategy {
        if self.weighted {
            LoadBalancingStrategy::WeightedLeastConnections
        } else {
            LoadBalancingStrategy::LeastConnections
        }
    }

    fn select(
        &self,
        pool: &[Arc<ServiceInstance>],
        _context: Option<&LoadBalancingContext>,
    ) -> Option<Arc<ServiceInstance>> {
        let mut best: Option<&Arc<ServiceInstance>> = None;
        for candidate in available(pool) {
            best = match best {
                Some(current) if self.compare(candidate, current) != Ordering::Less => {
                    Some(current)
                }
                _ => Some(candidate),
            };
        }
        best.map(Arc::clone)
    }
}

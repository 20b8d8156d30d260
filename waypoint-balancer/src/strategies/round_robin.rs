use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use waypoint_core::{LoadBalancingContext, ServiceInstance};

use super::{SelectionStrategy, available};
use crate::config::LoadBalancingStrategy;

/// Rotates through the available instances with a shared cursor.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::RoundRobin
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
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(Arc::clone(eligible[index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::testing::{ids, pool, with_health};
    use waypoint_core::HealthStatus;

    #[test]
    fn test_rotation_order() {
        let pool = pool(&["a", "b", "c"]);
        let rr = RoundRobin::new();
        let picks: Vec<_> = (0..4).filter_map(|_| rr.select(&pool, None)).collect();
        assert_eq!(ids(&picks), vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_skips_unavailable() {
        let pool = vec![
            with_health("a", HealthStatus::Healthy),
            with_health("b", HealthStatus::Unhealthy),
            with_health("c", HealthStatus::Warning),
        ];
        let rr = RoundRobin::new();
        let picks: Vec<_> = (0..4).filter_map(|_| rr.select(&pool, None)).collect();
        assert_eq!(ids(&picks), vec!["a", "c", "a", "c"]);
    }
}

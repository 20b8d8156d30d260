use std::sync::Arc;

use waypoint_core::{LoadBalancingContext, ServiceInstance};

use super::{SelectionStrategy, available};
use crate::config::LoadBalancingStrategy;
use crate::hash::stable_hash;

/// `hash(client_ip) % len(available)`.
///
/// Stable for a client as long as the available set does not change.
#[derive(Debug, Default)]
pub struct IpHash;

impl IpHash {
    pub fn new() -> Self {
        Self
    }
}

impl SelectionStrategy for IpHash {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::IpHash
    }

    fn select(
        &self,
        pool: &[Arc<ServiceInstance>],
        context: Option<&LoadBalancingContext>,
    ) -> Option<Arc<ServiceInstance>> {
        let ip = context.and_then(|ctx| ctx.client_ip.as_deref())?;
        let eligible = available(pool);
        if eligible.is_empty() {
            return None;
        }
        let index = (stable_hash(ip) % eligible.len() as u64) as usize;
        Some(Arc::clone(eligible[index]))
    }
}

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use waypoint_core::{LoadBalancingContext, ServiceInstance};

use super::SelectionStrategy;
use crate::config::LoadBalancingStrategy;
use crate::hash::stable_hash;

/// Hash ring with `virtual_nodes` positions per instance.
///
/// The ring covers the whole pool, unavailable instances included, so a
/// health flap does not move ring positions; lookups walk clockwise past
/// unavailable owners instead. Adding or removing one instance only
/// remaps the keys that instance owns.
#[derive(Debug)]
pub struct ConsistentHash {
    virtual_nodes: usize,
    ring: RwLock<Ring>,
}

#[derive(Debug, Default)]
struct Ring {
    members: Vec<String>,
    nodes: BTreeMap<u64, String>,
}

impl Ring {
    fn build(members: Vec<String>, virtual_nodes: usize) -> Self {
        let mut nodes = BTreeMap::new();
        for id in &members {
            for replica in 0..virtual_nodes {
                nodes.insert(stable_hash(&format!("{}#{}", id, replica)), id.clone());
            }
        }
        Self { members, nodes }
    }
}

impl ConsistentHash {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: RwLock::new(Ring::default()),
        }
    }

    fn members_of(pool: &[Arc<ServiceInstance>]) -> Vec<String> {
        let mut members: Vec<String> = pool.iter().map(|i| i.instance_id.clone()).collect();
        members.sort();
        members.dedup();
        members
    }

    fn ensure_ring(&self, pool: &[Arc<ServiceInstance>]) {
        let members = Self::members_of(pool);
        if self.ring.read().members == members {
            return;
        }
        let rebuilt = Ring::build(members, self.virtual_nodes);
        *self.ring.write() = rebuilt;
    }
}

impl SelectionStrategy for ConsistentHash {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::ConsistentHash
    }

    fn select(
        &self,
        pool: &[Arc<ServiceInstance>],
        context: Option<&LoadBalancingContext>,
    ) -> Option<Arc<ServiceInstance>> {
        let key = context.and_then(|ctx| ctx.hash_key())?;
        if pool.is_empty() {
            return None;
        }
        self.ensure_ring(pool);

        let point = stable_hash(key);
        let ring = self.ring.read();
        let mut rejected: HashSet<&str> = HashSet::new();
        let clockwise = ring.nodes.range(point..).chain(ring.nodes.range(..point));
        for (_, owner) in clockwise {
            if rejected.contains(owner.as_str()) {
                continue;
            }
            if let Some(instance) = pool.iter().find(|i| &i.instance_id == owner)
                && instance.is_available()
            {
                return Some(Arc::clone(instance));
            }
            rejected.insert(owner.as_str());
            if rejected.len() == ring.members.len() {
                break;
            }
        }
        None
    }

    fn on_pool_update(&self, pool: &[Arc<ServiceInstance>]) {
        self.ensure_ring(pool);
    }
}

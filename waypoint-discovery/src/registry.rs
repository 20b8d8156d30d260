//! The registry collaborator and an in-memory implementation of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::debug;
use waypoint_core::{HealthStatus, ServiceInstance};

use crate::error::{RegistryError, RegistryResult};

/// Source of truth for registered instances.
///
/// Implementations apply their own retry policy and fail with a typed
/// error; the resolver adds no second retry layer.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn list_instances(&self, service_name: &str) -> RegistryResult<Vec<Arc<ServiceInstance>>>;

    async fn healthy_instances(
        &self,
        service_name: &str,
    ) -> RegistryResult<Vec<Arc<ServiceInstance>>> {
        let instances = self.list_instances(service_name).await?;
        Ok(instances.into_iter().filter(|i| i.is_healthy()).collect())
    }
}

/// In-memory registry (for testing/development)
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    instances: Arc<RwLock<HashMap<String, Arc<ServiceInstance>>>>,
    unavailable: Arc<AtomicBool>,
    delay: Arc<Mutex<Option<Duration>>>,
    calls: Arc<AtomicU64>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance, replacing one with the same id.
    pub async fn register(&self, instance: ServiceInstance) -> Arc<ServiceInstance> {
        let instance = Arc::new(instance);
        debug!(
            service = %instance.service_name,
            instance = %instance.instance_id,
            "Registered instance"
        );
        self.instances
            .write()
            .await
            .insert(instance.instance_id.clone(), Arc::clone(&instance));
        instance
    }

    pub async fn deregister(&self, instance_id: &str) -> RegistryResult<Arc<ServiceInstance>> {
        self.instances
            .write()
            .await
            .remove(instance_id)
            .ok_or_else(|| RegistryError::InstanceNotFound(instance_id.to_string()))
    }

    /// Overwrite an instance's visible health.
    pub async fn set_health(&self, instance_id: &str, status: HealthStatus) -> RegistryResult<()> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(instance_id)
            .ok_or_else(|| RegistryError::InstanceNotFound(instance_id.to_string()))?;
        instance.set_health(status);
        Ok(())
    }

    /// Make every lookup fail with [`RegistryError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every lookup, e.g. to exercise timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Number of lookups served or refused so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn get(&self, instance_id: &str) -> Option<Arc<ServiceInstance>> {
        self.instances.read().await.get(instance_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn clear(&self) {
        self.instances.write().await.clear();
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn list_instances(&self, service_name: &str) -> RegistryResult<Vec<Arc<ServiceInstance>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry marked unavailable".into()));
        }

        let instances = self.instances.read().await;
        let mut matching: Vec<Arc<ServiceInstance>> = instances
            .values()
            .filter(|i| i.service_name == service_name)
            .cloned()
            .collect();
        if matching.is_empty() {
            return Err(RegistryError::ServiceNotFound(service_name.to_string()));
        }
        // Registration order, so selection is reproducible.
        matching.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(matching)
    }
}

impl std::fmt::Debug for InMemoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRegistry")
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .field("calls", &self.call_count())
            .finish()
    }
}

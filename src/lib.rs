//! Waypoint - client-side service resolution for Rust.
//!
//! Given a logical service name, Waypoint returns one healthy endpoint to
//! call and keeps a flapping or overloaded downstream away from callers:
//!
//! - [`cache`] - discovery cache with TTL, refresh-ahead and LRU eviction
//! - [`breaker`] - per-target circuit breakers
//! - [`balancer`] - ten load-balancing strategies behind one contract
//! - [`health`] - background health monitoring (feature `health`)
//! - [`discovery`] - the resolution flow tying them together
//!
//! ```
//! use std::sync::Arc;
//! use waypoint::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let registry = InMemoryRegistry::new();
//! registry
//!     .register(ServiceInstance::new("orders", ServiceEndpoint::new("10.0.0.7", 8080)))
//!     .await;
//!
//! let resolver = ResolutionCoordinator::builder(Arc::new(registry))
//!     .load_balancer(LoadBalancerConfig::new(LoadBalancingStrategy::RoundRobin))
//!     .build()
//!     .unwrap();
//!
//! let query = ServiceQuery::new("orders");
//! let instance = resolver.resolve(&query, None).await.unwrap().unwrap();
//! resolver.record_outcome(&instance, true, std::time::Duration::from_millis(12));
//! # });
//! ```

pub use waypoint_core::*;

pub use waypoint_balancer as balancer;
pub use waypoint_breaker as breaker;
pub use waypoint_cache as cache;
pub use waypoint_discovery as discovery;

#[cfg(feature = "health")]
pub use waypoint_health as health;

// Prelude for common imports
pub mod prelude {
    pub use waypoint_balancer::{LoadBalancer, LoadBalancerConfig, LoadBalancingStrategy};
    pub use waypoint_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
        CircuitBreakerStrategy, CircuitState,
    };
    pub use waypoint_cache::{CacheConfig, CacheStrategy, DiscoveryCache};
    pub use waypoint_core::{
        ConfigError, HealthStatus, InstanceMetadata, LoadBalancingContext, Protocol,
        ServiceEndpoint, ServiceInstance, ServiceQuery,
    };
    pub use waypoint_discovery::{
        ConfigLoader, DiscoveryResult, DiscoverySource, InMemoryRegistry, RegistryError,
        ResolutionCoordinator, ResolutionError, ResolverConfig, ServiceRegistry,
    };

    #[cfg(feature = "health")]
    pub use waypoint_health::{HealthCheckConfig, HealthCheckType, HealthMonitor, HealthStatusChange};
}

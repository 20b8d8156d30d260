//! Service resolution for Waypoint.
//!
//! Ties the discovery cache, circuit breakers and load balancers together
//! in front of a [`ServiceRegistry`]:
//!
//! - **Discover** - cached instance lists, registry lookups on a miss
//! - **Resolve** - breaker filtering, then one instance from a load balancer
//! - **Feedback** - outcomes flow back into balancers and breakers
//! - **Configuration** - [`ResolverConfig`] from TOML/JSON files and the environment
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use waypoint_core::{ServiceEndpoint, ServiceInstance, ServiceQuery};
//! use waypoint_discovery::*;
//!
//! # tokio_test::block_on(async {
//! let registry = InMemoryRegistry::new();
//! registry
//!     .register(ServiceInstance::new("orders", ServiceEndpoint::new("10.0.0.7", 8080)))
//!     .await;
//!
//! let resolver = ResolutionCoordinator::new(Arc::new(registry)).unwrap();
//! let instance = resolver
//!     .resolve(&ServiceQuery::new("orders"), None)
//!     .await
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(instance.address(), "10.0.0.7:8080");
//! # });
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod registry;

pub use config::{ConfigLoader, ENV_PREFIX, FileFormat, ResolverConfig};
pub use coordinator::{
    CoordinatorStats, DiscoveryResult, DiscoverySource, ResolutionCoordinator,
    ResolutionCoordinatorBuilder, ResolverStats,
};
pub use error::{RegistryError, RegistryResult, ResolutionError, ResolutionResult};
pub use registry::{InMemoryRegistry, ServiceRegistry};

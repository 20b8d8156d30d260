//! Instance selection for Waypoint
//!
//! A [`LoadBalancer`] holds the current candidate pool for one query and
//! picks an instance per request with one of ten strategies, optionally
//! backed by a fallback strategy.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use waypoint_balancer::{LoadBalancer, LoadBalancingStrategy};
//! use waypoint_core::{ServiceEndpoint, ServiceInstance};
//!
//! let lb = LoadBalancer::with_strategy(LoadBalancingStrategy::RoundRobin).unwrap();
//! lb.update_instances(vec![
//!     Arc::new(ServiceInstance::new("orders", ServiceEndpoint::new("10.0.0.1", 8080)).with_id("a")),
//!     Arc::new(ServiceInstance::new("orders", ServiceEndpoint::new("10.0.0.2", 8080)).with_id("b")),
//! ]);
//!
//! let instance = lb.select_instance(None).unwrap();
//! assert_eq!(instance.instance_id, "a");
//! lb.record_request(&instance, true, std::time::Duration::from_millis(8));
//! ```

pub mod balancer;
pub mod config;
mod hash;
pub mod strategies;

pub use balancer::{BalancerStats, InstanceStats, LoadBalancer};
pub use config::{LoadBalancerConfig, LoadBalancingStrategy};
pub use hash::stable_hash;
pub use strategies::{SelectionStrategy, create_strategy};

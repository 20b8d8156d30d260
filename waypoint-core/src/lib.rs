//! Shared model for the Waypoint service resolution engine.
//!
//! This crate holds the types every other Waypoint crate speaks:
//!
//! - **Instances** - [`ServiceInstance`] with its endpoint, metadata, health
//!   and live request counters
//! - **Queries** - [`ServiceQuery`] filters with deterministic cache keys
//! - **Context** - [`LoadBalancingContext`] hints for sticky strategies
//! - **Errors** - [`ConfigError`] raised when a component is misconfigured
//! - **Logging** - [`logging::LogConfig`] subscriber setup
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use waypoint_core::*;
//!
//! let instance = Arc::new(
//!     ServiceInstance::new("orders", ServiceEndpoint::new("10.0.0.7", 8080))
//!         .with_metadata(InstanceMetadata::new().with_zone("eu-west-1a").with_tag("primary")),
//! );
//!
//! let query = ServiceQuery::new("orders").with_tag("primary");
//! assert!(query.matches(&instance));
//! assert!(query.cache_key().starts_with("orders|"));
//! ```

pub mod context;
pub mod duration;
pub mod error;
pub mod instance;
pub mod logging;
pub mod query;

pub use context::LoadBalancingContext;
pub use duration::{duration_ms, option_duration_ms};
pub use error::{ConfigError, ConfigResult, ensure_positive, ensure_ratio};
pub use instance::{
    HealthStatus, InstanceMetadata, MIN_EFFECTIVE_WEIGHT, Protocol, RESPONSE_WINDOW,
    ServiceEndpoint, ServiceInstance,
};
pub use query::{KEY_DELIMITER, ServiceQuery, service_of_key};

/// Boxed error used at collaborator boundaries (refresh callbacks, custom probes).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

//! Circuit breakers for Waypoint.
//!
//! A [`CircuitBreaker`] guards one target (a service, or one instance of a
//! service) and stops calling it once it looks broken:
//!
//! - **Strategies** - trip on failure count, windowed failure rate or slow calls
//! - **Backoff** - the recovery timeout grows per consecutive trip, up to a cap
//! - **Half-open trials** - a bounded number of calls probe for recovery
//! - **Listeners** - sync or async callbacks on every state change
//! - **Registry** - [`CircuitBreakerRegistry`] hands out named breakers
//!
//! ```
//! use std::time::Duration;
//! use waypoint_breaker::*;
//!
//! # tokio_test::block_on(async {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("orders")
//!         .failure_threshold(3)
//!         .recovery_timeout(Duration::from_secs(10)),
//! )
//! .unwrap();
//!
//! let result: Result<u32, CircuitBreakerError<String>> = breaker.call(|| async { Ok(42) }).await;
//! assert_eq!(result.unwrap(), 42);
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! # });
//! ```

pub mod breaker;
pub mod config;
pub mod error;
pub mod registry;
mod window;

pub use breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState, StateTransition};
pub use config::{CircuitBreakerConfig, CircuitBreakerStrategy};
pub use error::CircuitBreakerError;
pub use registry::CircuitBreakerRegistry;

use std::time::Duration;

use thiserror::Error;
use waypoint_breaker::CircuitState;
use waypoint_core::ConfigError;

/// Failure reported by a [`ServiceRegistry`](crate::ServiceRegistry).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Registry did not answer within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Failure of `discover` or `resolve`.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(transparent)]
    RegistryUnavailable(#[from] RegistryError),

    /// The registry breaker refused the lookup
    #[error("Circuit breaker `{target}` is {state}")]
    CircuitOpen { target: String, state: CircuitState },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ResolutionError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

pub type ResolutionResult<T> = Result<T, ResolutionError>;

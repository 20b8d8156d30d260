use thiserror::Error;

use crate::breaker::CircuitState;

/// Failure returned by a guarded call.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The breaker refused the call. `state` is `Open`, or `HalfOpen` when
    /// every trial slot is taken.
    #[error("Circuit breaker `{name}` rejected the call ({state})")]
    Open { name: String, state: CircuitState },

    /// The call ran and failed
    #[error("Execution failed: {0}")]
    Execution(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// The wrapped error, if the call actually ran.
    pub fn into_execution(self) -> Option<E> {
        match self {
            Self::Execution(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

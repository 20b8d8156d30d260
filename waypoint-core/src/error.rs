//! Configuration error shared by every Waypoint component.

use thiserror::Error;

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while building or loading component configuration.
///
/// Misconfiguration is reported when a component is constructed, never
/// later at call time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value the component cannot work with
    #[error("Invalid configuration for `{field}`: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Configuration source could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Configuration source could not be read
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Create an invalid-field error.
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }

    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}

/// Reject a zero or negative numeric field.
pub fn ensure_positive<T>(field: &'static str, value: T) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::invalid(
            field,
            format!("must be greater than zero (got {})", value),
        ));
    }
    Ok(())
}

/// Reject a ratio outside `[0.0, 1.0]`.
pub fn ensure_ratio(field: &'static str, value: f64) -> ConfigResult<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(ConfigError::invalid(
            field,
            format!("must be within 0.0..=1.0 (got {})", value),
        ));
    }
    Ok(())
}

//! Cache configuration types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use waypoint_core::{ConfigError, ConfigResult, ensure_positive};

/// How the discovery cache treats entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// Caching disabled: every `get` misses and `put` is ignored
    None,
    /// Entries live for `ttl` and are then dropped
    #[default]
    Ttl,
    /// Like `Ttl`, but entries past `ttl * refresh_ahead_factor` are
    /// refreshed in the background while still being served
    RefreshAhead,
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheStrategy::None => "none",
            CacheStrategy::Ttl => "ttl",
            CacheStrategy::RefreshAhead => "refresh_ahead",
        };
        f.write_str(name)
    }
}

impl FromStr for CacheStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" | "disabled" => Ok(CacheStrategy::None),
            "ttl" => Ok(CacheStrategy::Ttl),
            "refresh_ahead" => Ok(CacheStrategy::RefreshAhead),
            other => Err(ConfigError::invalid(
                "cache.strategy",
                format!("unknown cache strategy `{}`", other),
            )),
        }
    }
}

/// Discovery cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub strategy: CacheStrategy,

    /// Lifetime of an entry
    #[serde(with = "waypoint_core::duration_ms")]
    pub ttl: Duration,

    /// Entries kept before the least recently used one is evicted
    pub max_size: usize,

    /// Fraction of `ttl` after which refresh-ahead kicks in
    pub refresh_ahead_factor: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::Ttl,
            ttl: Duration::from_secs(30),
            max_size: 1000,
            refresh_ahead_factor: 0.8,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_refresh_ahead_factor(mut self, factor: f64) -> Self {
        self.refresh_ahead_factor = factor;
        self
    }

    /// Age after which a refresh-ahead is scheduled.
    pub fn refresh_threshold(&self) -> Duration {
        self.ttl.mul_f64(self.refresh_ahead_factor)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.ttl.is_zero() {
            return Err(ConfigError::invalid("cache.ttl", "must be greater than zero"));
        }
        ensure_positive("cache.max_size", self.max_size)?;
        if !(self.refresh_ahead_factor > 0.0 && self.refresh_ahead_factor <= 1.0) {
            return Err(ConfigError::invalid(
                "cache.refresh_ahead_factor",
                format!("must be within (0.0, 1.0] (got {})", self.refresh_ahead_factor),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        assert_eq!(config.strategy, CacheStrategy::Ttl);
        assert_eq!(config.max_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(CacheConfig::new().with_ttl(Duration::ZERO).validate().is_err());
        assert!(CacheConfig::new().with_max_size(0).validate().is_err());
        assert!(CacheConfig::new().with_refresh_ahead_factor(0.0).validate().is_err());
        assert!(CacheConfig::new().with_refresh_ahead_factor(1.2).validate().is_err());
    }

    #[test]
    fn test_refresh_threshold() {
        let config = CacheConfig::new()
            .with_ttl(Duration::from_millis(100))
            .with_refresh_ahead_factor(0.5);
        assert_eq!(config.refresh_threshold(), Duration::from_millis(50));
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "refresh-ahead".parse::<CacheStrategy>().unwrap(),
            CacheStrategy::RefreshAhead
        );
        assert_eq!("NONE".parse::<CacheStrategy>().unwrap(), CacheStrategy::None);
        assert!("lfu".parse::<CacheStrategy>().is_err());
    }
}

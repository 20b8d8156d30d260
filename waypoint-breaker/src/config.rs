//! Circuit breaker configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use waypoint_core::{ConfigError, ConfigResult, ensure_positive};

/// Condition that trips a closed breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerStrategy {
    /// Failures since the breaker last closed reach `failure_threshold`
    #[default]
    FailureCount,
    /// Windowed failure rate reaches `failure_rate_threshold`, once the
    /// window holds `minimum_request_threshold` outcomes
    FailureRate,
    /// Slow calls in the window reach `slow_request_threshold`
    ResponseTime,
}

impl fmt::Display for CircuitBreakerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitBreakerStrategy::FailureCount => "failure_count",
            CircuitBreakerStrategy::FailureRate => "failure_rate",
            CircuitBreakerStrategy::ResponseTime => "response_time",
        };
        f.write_str(name)
    }
}

impl FromStr for CircuitBreakerStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "failure_count" => Ok(Self::FailureCount),
            "failure_rate" => Ok(Self::FailureRate),
            "response_time" => Ok(Self::ResponseTime),
            other => Err(ConfigError::invalid(
                "circuit_breaker.strategy",
                format!("unknown strategy `{}`", other),
            )),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Name used in logs and metrics
    pub name: String,
    pub strategy: CircuitBreakerStrategy,

    pub failure_threshold: u32,
    pub failure_rate_threshold: f64,
    pub minimum_request_threshold: u32,

    /// Calls slower than this count as slow
    #[serde(with = "waypoint_core::duration_ms")]
    pub response_time_threshold: Duration,
    pub slow_request_threshold: u32,

    /// Time spent open before trial calls are let through
    #[serde(with = "waypoint_core::duration_ms")]
    pub recovery_timeout: Duration,
    pub exponential_backoff: bool,
    pub backoff_multiplier: f64,
    #[serde(with = "waypoint_core::duration_ms")]
    pub max_recovery_timeout: Duration,

    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
    pub half_open_max_calls: u32,
    #[serde(with = "waypoint_core::duration_ms")]
    pub half_open_timeout: Duration,

    /// Outcomes kept in the sliding window (count bound)
    pub sliding_window_size: usize,
    /// Age after which an outcome leaves the window (time bound)
    #[serde(with = "waypoint_core::duration_ms")]
    pub time_window_size: Duration,

    /// State transitions retained for inspection
    pub transition_log_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            strategy: CircuitBreakerStrategy::FailureCount,
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            minimum_request_threshold: 10,
            response_time_threshold: Duration::from_secs(5),
            slow_request_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            exponential_backoff: true,
            backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
            success_threshold: 3,
            half_open_max_calls: 5,
            half_open_timeout: Duration::from_secs(30),
            sliding_window_size: 100,
            time_window_size: Duration::from_secs(60),
            transition_log_size: 50,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Same settings under another name.
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn strategy(mut self, strategy: CircuitBreakerStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn failure_rate_threshold(mut self, rate: f64) -> Self {
        self.failure_rate_threshold = rate;
        self
    }

    pub fn minimum_request_threshold(mut self, count: u32) -> Self {
        self.minimum_request_threshold = count;
        self
    }

    pub fn response_time_threshold(mut self, threshold: Duration) -> Self {
        self.response_time_threshold = threshold;
        self
    }

    pub fn slow_request_threshold(mut self, count: u32) -> Self {
        self.slow_request_threshold = count;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Enable exponential growth of the recovery timeout per trip.
    pub fn exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn max_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.max_recovery_timeout = timeout;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    pub fn half_open_timeout(mut self, timeout: Duration) -> Self {
        self.half_open_timeout = timeout;
        self
    }

    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.sliding_window_size = size;
        self
    }

    pub fn time_window_size(mut self, window: Duration) -> Self {
        self.time_window_size = window;
        self
    }

    /// Recovery timeout to apply after the `attempt`-th consecutive trip
    /// (1-based). The first trip always waits the base timeout.
    pub fn recovery_timeout_for(&self, attempt: u32) -> Duration {
        if !self.exponential_backoff || attempt <= 1 {
            return self.recovery_timeout;
        }
        let exponent = (attempt - 1).min(64) as i32;
        let scaled = self.recovery_timeout.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_recovery_timeout.as_secs_f64() {
            self.max_recovery_timeout
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        ensure_positive("circuit_breaker.failure_threshold", self.failure_threshold)?;
        ensure_positive("circuit_breaker.success_threshold", self.success_threshold)?;
        ensure_positive("circuit_breaker.half_open_max_calls", self.half_open_max_calls)?;
        if self.success_threshold > self.half_open_max_calls {
            return Err(ConfigError::invalid(
                "circuit_breaker.success_threshold",
                format!(
                    "must not exceed half_open_max_calls ({} > {})",
                    self.success_threshold, self.half_open_max_calls
                ),
            ));
        }
        ensure_positive("circuit_breaker.slow_request_threshold", self.slow_request_threshold)?;
        ensure_positive(
            "circuit_breaker.minimum_request_threshold",
            self.minimum_request_threshold,
        )?;
        ensure_positive("circuit_breaker.sliding_window_size", self.sliding_window_size)?;

        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_rate_threshold",
                format!("must be within (0.0, 1.0] (got {})", self.failure_rate_threshold),
            ));
        }
        for (field, value) in [
            ("circuit_breaker.recovery_timeout", self.recovery_timeout),
            ("circuit_breaker.half_open_timeout", self.half_open_timeout),
            ("circuit_breaker.time_window_size", self.time_window_size),
            ("circuit_breaker.response_time_threshold", self.response_time_threshold),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        if self.exponential_backoff {
            if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
                return Err(ConfigError::invalid(
                    "circuit_breaker.backoff_multiplier",
                    format!("must be at least 1.0 (got {})", self.backoff_multiplier),
                ));
            }
            if self.max_recovery_timeout < self.recovery_timeout {
                return Err(ConfigError::invalid(
                    "circuit_breaker.max_recovery_timeout",
                    "must not be shorter than recovery_timeout",
                ));
            }
        }
        Ok(())
    }
}

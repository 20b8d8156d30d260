//! Health check configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use waypoint_breaker::CircuitBreakerConfig;
use waypoint_core::{ConfigError, ConfigResult, duration_ms, ensure_positive};

/// How an instance is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckType {
    #[default]
    Http,
    Https,
    /// TCP connect
    Tcp,
    /// Datagram echo
    Udp,
    /// User supplied async check
    Custom,
    /// Several probes aggregated by a [`CompositePolicy`]
    Composite,
}

impl HealthCheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Custom => "custom",
            Self::Composite => "composite",
        }
    }
}

impl fmt::Display for HealthCheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthCheckType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "custom" => Ok(Self::Custom),
            "composite" => Ok(Self::Composite),
            other => Err(ConfigError::invalid(
                "health_check.check_type",
                format!("unknown check type `{}`", other),
            )),
        }
    }
}

/// How a composite probe folds its members into one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositePolicy {
    /// Healthy only if every member is healthy
    #[default]
    AllHealthy,
    /// Healthy if at least one member is healthy
    AnyHealthy,
}

/// Health check configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub check_type: HealthCheckType,
    /// Pause between two checks of one instance
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Upper bound for one probe
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Extra attempts within one check before it counts as failed
    pub retries: u32,
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
    /// Consecutive passing checks before a failed instance turns healthy
    pub healthy_threshold: u32,
    /// Consecutive failed checks before a healthy instance turns unhealthy
    pub unhealthy_threshold: u32,
    /// HTTP path, e.g. `/health`
    pub path: String,
    pub method: String,
    pub expected_status: Vec<u16>,
    pub headers: BTreeMap<String, String>,
    /// Datagram sent by UDP probes
    pub udp_payload: String,
    pub composite_policy: CompositePolicy,
    /// Guard the checker itself so a dead endpoint is not hammered
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_type: HealthCheckType::Http,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries: 0,
            retry_delay: Duration::from_millis(100),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            path: "/health".to_string(),
            method: "GET".to_string(),
            expected_status: vec![200],
            headers: BTreeMap::new(),
            udp_payload: "ping".to_string(),
            composite_policy: CompositePolicy::AllHealthy,
            circuit_breaker_enabled: true,
            circuit_breaker: CircuitBreakerConfig::default()
                .failure_threshold(5)
                .recovery_timeout(Duration::from_secs(30)),
        }
    }
}

impl HealthCheckConfig {
    pub fn new(check_type: HealthCheckType) -> Self {
        Self {
            check_type,
            ..Default::default()
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    pub fn healthy_threshold(mut self, threshold: u32) -> Self {
        self.healthy_threshold = threshold;
        self
    }

    pub fn unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn expected_status(mut self, codes: Vec<u16>) -> Self {
        self.expected_status = codes;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn udp_payload(mut self, payload: impl Into<String>) -> Self {
        self.udp_payload = payload.into();
        self
    }

    pub fn composite_policy(mut self, policy: CompositePolicy) -> Self {
        self.composite_policy = policy;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_enabled = true;
        self.circuit_breaker = config;
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker_enabled = false;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (field, value) in [
            ("health_check.interval", self.interval),
            ("health_check.timeout", self.timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        ensure_positive("health_check.healthy_threshold", self.healthy_threshold)?;
        ensure_positive("health_check.unhealthy_threshold", self.unhealthy_threshold)?;
        if matches!(self.check_type, HealthCheckType::Http | HealthCheckType::Https) {
            if self.expected_status.is_empty() {
                return Err(ConfigError::invalid(
                    "health_check.expected_status",
                    "at least one status code is required",
                ));
            }
            if !self.path.starts_with('/') {
                return Err(ConfigError::invalid(
                    "health_check.path",
                    format!("must start with `/` (got `{}`)", self.path),
                ));
            }
        }
        if self.circuit_breaker_enabled {
            self.circuit_breaker.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = HealthCheckConfig::new(HealthCheckType::Https)
            .path("/healthz")
            .method("HEAD")
            .timeout(Duration::from_secs(2))
            .interval(Duration::from_secs(10))
            .healthy_threshold(1)
            .unhealthy_threshold(4)
            .header("x-probe", "waypoint");

        assert_eq!(config.check_type, HealthCheckType::Https);
        assert_eq!(config.path, "/healthz");
        assert_eq!(config.unhealthy_threshold, 4);
        assert_eq!(config.headers["x-probe"], "waypoint");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(HealthCheckConfig::default().timeout(Duration::ZERO).validate().is_err());
        assert!(HealthCheckConfig::default().healthy_threshold(0).validate().is_err());
        assert!(HealthCheckConfig::default().expected_status(vec![]).validate().is_err());
        assert!(HealthCheckConfig::default().path("health").validate().is_err());
        assert!(
            HealthCheckConfig::new(HealthCheckType::Tcp)
                .expected_status(vec![])
                .validate()
                .is_ok()
        );
        let bad_breaker = CircuitBreakerConfig::default().failure_threshold(0);
        assert!(HealthCheckConfig::default().circuit_breaker(bad_breaker.clone()).validate().is_err());
        assert!(
            HealthCheckConfig::default()
                .circuit_breaker(bad_breaker)
                .without_circuit_breaker()
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_check_type_parsing() {
        assert_eq!("TCP".parse::<HealthCheckType>().unwrap(), HealthCheckType::Tcp);
        assert!("icmp".parse::<HealthCheckType>().is_err());
    }
}

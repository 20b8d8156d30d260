//! Service instances and their live counters.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Number of recent response times kept per instance.
pub const RESPONSE_WINDOW: usize = 100;

/// Smallest value `effective_weight` ever reports.
pub const MIN_EFFECTIVE_WEIGHT: f64 = 0.1;

/// Latency at or below which an instance is not penalized.
const LATENCY_BASELINE_MS: f64 = 100.0;

/// Health of a single instance as last reported by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Degraded but still serving
    Warning,
    Unhealthy,
    /// The last probe did not answer in time
    Timeout,
    /// Never probed
    Unknown,
}

impl HealthStatus {
    /// Whether an instance in this status may still receive traffic.
    pub fn is_available(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Warning)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Timeout => "timeout",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport spoken by an endpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
    Grpc,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Grpc => "grpc",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "grpc" => Ok(Protocol::Grpc),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(ConfigError::invalid(
                "protocol",
                format!("unknown protocol `{}`", other),
            )),
        }
    }
}

/// Network location of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
}

fn default_tls_verify() -> bool {
    true
}

impl ServiceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Http,
            tls_enabled: false,
            tls_verify: true,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        if protocol == Protocol::Https {
            self.tls_enabled = true;
        }
        self
    }

    /// Enable TLS, optionally skipping certificate verification.
    pub fn with_tls(mut self, verify: bool) -> Self {
        self.tls_enabled = true;
        self.tls_verify = verify;
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        let scheme = match (self.protocol, self.tls_enabled) {
            (Protocol::Http, true) | (Protocol::Https, _) => "https",
            (Protocol::Http, false) => "http",
            (other, _) => other.as_str(),
        };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Descriptive attributes used by query filtering and weighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceMetadata {
    pub version: Option<String>,
    pub environment: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub tags: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
    /// Configured static weight
    pub weight: u32,
    /// Connection count at which the instance is considered saturated
    pub max_connections: u32,
}

impl Default for InstanceMetadata {
    fn default() -> Self {
        Self {
            version: None,
            environment: None,
            region: None,
            zone: None,
            tags: BTreeSet::new(),
            labels: BTreeMap::new(),
            weight: 1,
            max_connections: 100,
        }
    }
}

impl InstanceMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

#[derive(Debug)]
struct HealthRecord {
    status: HealthStatus,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_check: Option<DateTime<Utc>>,
}

/// A registered instance of a service.
///
/// Identity, endpoint and metadata are fixed at registration. Health and
/// the request counters change underneath shared references, so instances
/// are passed around as `Arc<ServiceInstance>`.
#[derive(Debug)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub endpoint: ServiceEndpoint,
    pub metadata: InstanceMetadata,
    pub registered_at: DateTime<Utc>,
    health: RwLock<HealthRecord>,
    active_connections: AtomicU64,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    response_times: Mutex<VecDeque<f64>>,
}

impl ServiceInstance {
    /// Create a healthy instance with a generated id.
    pub fn new(service_name: impl Into<String>, endpoint: ServiceEndpoint) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            endpoint,
            metadata: InstanceMetadata::default(),
            registered_at: Utc::now(),
            health: RwLock::new(HealthRecord {
                status: HealthStatus::Healthy,
                consecutive_successes: 0,
                consecutive_failures: 0,
                last_check: None,
            }),
            active_connections: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            response_times: Mutex::new(VecDeque::with_capacity(RESPONSE_WINDOW)),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: InstanceMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the initial health status.
    pub fn with_health(self, status: HealthStatus) -> Self {
        self.health.write().status = status;
        self
    }

    pub fn url(&self) -> String {
        self.endpoint.url()
    }

    pub fn address(&self) -> String {
        self.endpoint.address()
    }

    pub fn health(&self) -> HealthStatus {
        self.health.read().status
    }

    /// Only `Healthy` counts.
    pub fn is_healthy(&self) -> bool {
        self.health() == HealthStatus::Healthy
    }

    /// `Healthy` or `Warning`.
    pub fn is_available(&self) -> bool {
        self.health().is_available()
    }

    /// Overwrite the visible health status, returning the previous one.
    pub fn set_health(&self, status: HealthStatus) -> HealthStatus {
        let mut record = self.health.write();
        let previous = record.status;
        record.status = status;
        record.last_check = Some(Utc::now());
        previous
    }

    /// Record one raw probe outcome and return the updated
    /// `(consecutive_successes, consecutive_failures)`.
    pub fn record_probe(&self, success: bool) -> (u32, u32) {
        let mut record = self.health.write();
        if success {
            record.consecutive_successes = record.consecutive_successes.saturating_add(1);
            record.consecutive_failures = 0;
        } else {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.consecutive_successes = 0;
        }
        record.last_check = Some(Utc::now());
        (record.consecutive_successes, record.consecutive_failures)
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.health.read().consecutive_successes
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.health.read().consecutive_failures
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.health.read().last_check
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the active connection count, never below zero.
    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Fold a finished request into the counters and close its connection.
    pub fn record_request(&self, success: bool, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut window = self.response_times.lock();
            if window.len() == RESPONSE_WINDOW {
                window.pop_front();
            }
            window.push_back(latency.as_secs_f64() * 1000.0);
        }

        self.connection_closed();
    }

    /// Fraction of successful requests; 1.0 before any traffic.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 1.0;
        }
        let failures = self.total_failures().min(total);
        (total - failures) as f64 / total as f64
    }

    /// Mean of the recent response time window in milliseconds.
    pub fn average_latency_ms(&self) -> Option<f64> {
        let window = self.response_times.lock();
        if window.is_empty() {
            return None;
        }
        Some(window.iter().sum::<f64>() / window.len() as f64)
    }

    /// Dynamic weight combining configured weight, success rate, latency
    /// and connection saturation. Never below [`MIN_EFFECTIVE_WEIGHT`].
    pub fn effective_weight(&self) -> f64 {
        let base = self.metadata.weight as f64;

        let latency_factor = match self.average_latency_ms() {
            Some(avg) if avg > LATENCY_BASELINE_MS => LATENCY_BASELINE_MS / avg,
            _ => 1.0,
        };

        let saturation = if self.metadata.max_connections == 0 {
            1.0
        } else {
            (self.active_connections() as f64 / self.metadata.max_connections as f64).min(1.0)
        };
        let load_factor = 0.5 + 0.5 * (1.0 - saturation);

        (base * self.success_rate() * latency_factor * load_factor).max(MIN_EFFECTIVE_WEIGHT)
    }
}

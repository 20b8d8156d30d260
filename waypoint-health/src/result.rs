use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use waypoint_core::{HealthStatus, duration_ms};

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    #[serde(with = "duration_ms")]
    pub latency: Duration,
    pub message: Option<String>,
    /// HTTP status code, for HTTP probes that got a response
    pub http_status: Option<u16>,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn new(status: HealthStatus, latency: Duration) -> Self {
        Self {
            status,
            latency,
            message: None,
            http_status: None,
            checked_at: Utc::now(),
        }
    }

    pub fn healthy(latency: Duration) -> Self {
        Self::new(HealthStatus::Healthy, latency)
    }

    pub fn unhealthy(latency: Duration, message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, latency).with_message(message)
    }

    pub fn timed_out(after: Duration) -> Self {
        Self::new(HealthStatus::Timeout, after)
            .with_message(format!("no answer within {}ms", after.as_millis()))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_http_status(mut self, code: u16) -> Self {
        self.http_status = Some(code);
        self
    }

    /// Healthy or Warning.
    pub fn is_passing(&self) -> bool {
        self.status.is_available()
    }
}

/// A debounced change of an instance's visible health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatusChange {
    pub service_name: String,
    pub instance_id: String,
    pub previous: HealthStatus,
    pub current: HealthStatus,
    /// The check that completed the threshold
    pub result: HealthCheckResult,
    pub at: DateTime<Utc>,
}

//! Probe implementations
//!
//! A probe performs exactly one check of one instance. Retries, timeouts,
//! debouncing and the checker's own circuit breaker are layered on top by
//! [`HealthChecker`](crate::HealthChecker).

mod composite;
mod custom;
mod http;
mod socket;

pub use composite::CompositeProbe;
pub use custom::{CustomProbe, custom_probe};
pub use http::HttpProbe;
pub use socket::{TcpProbe, UdpProbe};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use waypoint_core::{ConfigError, ConfigResult, ServiceInstance};

use crate::config::{HealthCheckConfig, HealthCheckType};
use crate::result::HealthCheckResult;

/// One health probe.
#[async_trait]
pub trait HealthProbe: Send + Sync + fmt::Debug {
    fn kind(&self) -> HealthCheckType;

    /// Probe `instance` once. Implementations honor `config.timeout`.
    async fn probe(
        &self,
        instance: &Arc<ServiceInstance>,
        config: &HealthCheckConfig,
    ) -> HealthCheckResult;
}

/// Build the probe for the built-in check types.
///
/// Custom and composite checks carry user code, so they are registered
/// with an explicit probe instead.
pub fn probe_for(config: &HealthCheckConfig) -> ConfigResult<Arc<dyn HealthProbe>> {
    match config.check_type {
        HealthCheckType::Http => Ok(Arc::new(HttpProbe::new())),
        HealthCheckType::Https => Ok(Arc::new(HttpProbe::new().force_tls())),
        HealthCheckType::Tcp => Ok(Arc::new(TcpProbe)),
        HealthCheckType::Udp => Ok(Arc::new(UdpProbe)),
        kind @ (HealthCheckType::Custom | HealthCheckType::Composite) => Err(ConfigError::invalid(
            "health_check.check_type",
            format!("`{}` checks must be registered with an explicit probe", kind),
        )),
    }
}

//! Health monitoring for Waypoint
//!
//! [`HealthMonitor`] runs one cancellable loop per registered instance.
//! Each loop probes the instance, debounces the result against the
//! configured thresholds and updates the instance's visible
//! [`HealthStatus`](waypoint_core::HealthStatus), which the load balancer
//! and resolution flow read.
//!
//! Probes: HTTP(S), TCP connect, UDP echo, custom async checks and
//! composites of those.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use waypoint_core::{ServiceEndpoint, ServiceInstance};
//! use waypoint_health::{HealthCheckConfig, HealthMonitor};
//!
//! # async fn run() -> Result<(), waypoint_core::ConfigError> {
//! let monitor = HealthMonitor::new(
//!     HealthCheckConfig::default()
//!         .path("/healthz")
//!         .interval(Duration::from_secs(10)),
//! )?;
//! monitor.on_status_change(|change| {
//!     println!("{} is now {}", change.instance_id, change.current);
//! });
//!
//! let instance = Arc::new(ServiceInstance::new("orders", ServiceEndpoint::new("10.0.0.5", 8080)));
//! monitor.register(instance)?;
//! monitor.start();
//! # monitor.shutdown(Duration::from_secs(1)).await;
//! # Ok(())
//! # }
//! ```

pub mod checker;
pub mod config;
pub mod monitor;
pub mod probes;
pub mod result;

pub use checker::{CheckerStats, HealthChecker};
pub use config::{CompositePolicy, HealthCheckConfig, HealthCheckType};
pub use monitor::{HealthMonitor, MonitorStats};
pub use probes::{
    CompositeProbe, CustomProbe, HealthProbe, HttpProbe, TcpProbe, UdpProbe, custom_probe,
    probe_for,
};
pub use result::{HealthCheckResult, HealthStatusChange};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::time::{Instant, timeout};
use waypoint_core::{HealthStatus, ServiceInstance};

use super::HealthProbe;
use crate::config::{HealthCheckConfig, HealthCheckType};
use crate::result::HealthCheckResult;

type CheckFn = Arc<dyn Fn(Arc<ServiceInstance>) -> BoxFuture<'static, HealthStatus> + Send + Sync>;

/// Runs a user supplied async check under the configured timeout.
#[derive(Clone)]
pub struct CustomProbe {
    name: String,
    check: CheckFn,
}

impl CustomProbe {
    pub fn new(name: impl Into<String>, check: CheckFn) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Build a [`CustomProbe`] from an async closure.
pub fn custom_probe<F, Fut>(name: impl Into<String>, f: F) -> CustomProbe
where
    F: Fn(Arc<ServiceInstance>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HealthStatus> + Send + 'static,
{
    CustomProbe::new(name, Arc::new(move |instance| Box::pin(f(instance))))
}

impl fmt::Debug for CustomProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomProbe").field("name", &self.name).finish()
    }
}

#[async_trait]
impl HealthProbe for CustomProbe {
    fn kind(&self) -> HealthCheckType {
        HealthCheckType::Custom
    }

    async fn probe(
        &self,
        instance: &Arc<ServiceInstance>,
        config: &HealthCheckConfig,
    ) -> HealthCheckResult {
        let start = Instant::now();
        match timeout(config.timeout, (self.check)(Arc::clone(instance))).await {
            Ok(status) => HealthCheckResult::new(status, start.elapsed())
                .with_message(format!("custom check `{}`", self.name)),
            Err(_) => HealthCheckResult::timed_out(config.timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use waypoint_core::ServiceEndpoint;

    fn instance() -> Arc<ServiceInstance> {
        Arc::new(ServiceInstance::new("orders", ServiceEndpoint::new("10.0.0.1", 8080)))
    }

    #[tokio::test]
    async fn test_reports_closure_status() {
        let probe = custom_probe("queue-depth", |_| async { HealthStatus::Warning });
        let result = probe.probe(&instance(), &HealthCheckConfig::default()).await;
        assert_eq!(result.status, HealthStatus::Warning);
        assert_eq!(probe.name(), "queue-depth");
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let probe = custom_probe("stuck", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            HealthStatus::Healthy
        });
        let config = HealthCheckConfig::default().timeout(Duration::from_secs(1));
        let result = probe.probe(&instance(), &config).await;
        assert_eq!(result.status, HealthStatus::Timeout);
    }
}

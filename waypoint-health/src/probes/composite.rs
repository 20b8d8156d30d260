use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use tracing::error;
use waypoint_core::{HealthStatus, ServiceInstance};

use super::HealthProbe;
use crate::config::{CompositePolicy, HealthCheckConfig, HealthCheckType};
use crate::result::HealthCheckResult;

/// Runs several probes concurrently and folds them into one status.
///
/// A member that panics counts as unhealthy; the others still complete.
#[derive(Debug, Clone)]
pub struct CompositeProbe {
    members: Vec<Arc<dyn HealthProbe>>,
    policy: Option<CompositePolicy>,
}

impl CompositeProbe {
    pub fn new(members: Vec<Arc<dyn HealthProbe>>) -> Self {
        Self {
            members,
            policy: None,
        }
    }

    /// Override `config.composite_policy`.
    pub fn with_policy(mut self, policy: CompositePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn fold(policy: CompositePolicy, results: &[HealthCheckResult]) -> HealthStatus {
        let any = |status: HealthStatus| results.iter().any(|r| r.status == status);
        match policy {
            CompositePolicy::AllHealthy => {
                if results.iter().all(|r| r.status == HealthStatus::Healthy) {
                    HealthStatus::Healthy
                } else if any(HealthStatus::Unhealthy) {
                    HealthStatus::Unhealthy
                } else if any(HealthStatus::Timeout) {
                    HealthStatus::Timeout
                } else {
                    HealthStatus::Warning
                }
            }
            CompositePolicy::AnyHealthy => {
                if any(HealthStatus::Healthy) {
                    HealthStatus::Healthy
                } else if any(HealthStatus::Warning) {
                    HealthStatus::Warning
                } else if !results.is_empty() && results.iter().all(|r| r.status == HealthStatus::Timeout) {
                    HealthStatus::Timeout
                } else {
                    HealthStatus::Unhealthy
                }
            }
        }
    }
}

#[async_trait]
impl HealthProbe for CompositeProbe {
    fn kind(&self) -> HealthCheckType {
        HealthCheckType::Composite
    }

    async fn probe(
        &self,
        instance: &Arc<ServiceInstance>,
        config: &HealthCheckConfig,
    ) -> HealthCheckResult {
        if self.members.is_empty() {
            return HealthCheckResult::unhealthy(Duration::ZERO, "composite check has no members");
        }

        let runs = self.members.iter().map(|member| {
            let member = Arc::clone(member);
            async move {
                match AssertUnwindSafe(member.probe(instance, config)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        error!(
                            instance = %instance.instance_id,
                            probe = %member.kind(),
                            "Health probe panicked"
                        );
                        HealthCheckResult::unhealthy(Duration::ZERO, "probe panicked")
                    }
                }
            }
        });
        let results = join_all(runs).await;

        let policy = self.policy.unwrap_or(config.composite_policy);
        let status = Self::fold(policy, &results);
        let latency = results.iter().map(|r| r.latency).max().unwrap_or_default();
        let failures: Vec<String> = results
            .iter()
            .filter(|r| r.status != HealthStatus::Healthy)
            .filter_map(|r| r.message.clone())
            .collect();

        let result = HealthCheckResult::new(status, latency);
        if failures.is_empty() {
            result
        } else {
            result.with_message(failures.join("; "))
        }
    }
}

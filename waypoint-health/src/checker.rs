//! One instance, one probe: retries, timeout, self-protection and
//! debouncing of the visible status.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info};
use waypoint_breaker::CircuitBreaker;
use waypoint_core::{ConfigResult, HealthStatus, ServiceInstance};

use crate::config::HealthCheckConfig;
use crate::probes::HealthProbe;
use crate::result::{HealthCheckResult, HealthStatusChange};

/// Counters of one checker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckerStats {
    pub checks: u64,
    pub failed_checks: u64,
    /// Checks skipped because the checker's own breaker was open
    pub short_circuited: u64,
    pub status_changes: u64,
    pub last_result: Option<HealthCheckResult>,
}

/// Checks one instance with one probe.
#[derive(Debug)]
pub struct HealthChecker {
    instance: Arc<ServiceInstance>,
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    breaker: Option<Arc<CircuitBreaker>>,
    checks: AtomicU64,
    failed_checks: AtomicU64,
    short_circuited: AtomicU64,
    status_changes: AtomicU64,
    last_result: RwLock<Option<HealthCheckResult>>,
}

impl HealthChecker {
    pub fn new(
        instance: Arc<ServiceInstance>,
        config: HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let breaker = if config.circuit_breaker_enabled {
            let name = format!("health:{}:{}", instance.service_name, instance.instance_id);
            Some(CircuitBreaker::new(config.circuit_breaker.named(name))?)
        } else {
            None
        };
        Ok(Self {
            instance,
            config,
            probe,
            breaker,
            checks: AtomicU64::new(0),
            failed_checks: AtomicU64::new(0),
            short_circuited: AtomicU64::new(0),
            status_changes: AtomicU64::new(0),
            last_result: RwLock::new(None),
        })
    }

    pub fn instance(&self) -> &Arc<ServiceInstance> {
        &self.instance
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Breaker guarding this checker, if enabled.
    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// One check: up to `1 + retries` probe attempts, each bounded by the
    /// configured timeout. Does not touch the instance's visible status.
    pub async fn check(&self) -> HealthCheckResult {
        let mut attempt = 0;
        loop {
            let result = self.attempt().await;
            if result.is_passing() || attempt >= self.config.retries {
                return result;
            }
            attempt += 1;
            debug!(
                instance = %self.instance.instance_id,
                attempt,
                status = %result.status,
                "Retrying health check"
            );
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }

    async fn attempt(&self) -> HealthCheckResult {
        if let Some(breaker) = &self.breaker
            && let Err(state) = breaker.try_acquire()
        {
            self.short_circuited.fetch_add(1, Ordering::Relaxed);
            return HealthCheckResult::unhealthy(
                Duration::ZERO,
                format!("checker circuit {}", state),
            );
        }

        let start = Instant::now();
        let probe = AssertUnwindSafe(self.probe.probe(&self.instance, &self.config)).catch_unwind();
        let result = match timeout(self.config.timeout, probe).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!(
                    instance = %self.instance.instance_id,
                    probe = %self.probe.kind(),
                    "Health probe panicked"
                );
                HealthCheckResult::unhealthy(start.elapsed(), "probe panicked")
            }
            Err(_) => HealthCheckResult::timed_out(self.config.timeout),
        };

        if let Some(breaker) = &self.breaker {
            if result.is_passing() {
                breaker.record_success(start.elapsed());
            } else {
                breaker.record_failure(start.elapsed());
            }
        }
        result
    }

    /// Check once and fold the result into the instance's visible status.
    ///
    /// A passing result only restores a failed instance after
    /// `healthy_threshold` consecutive passes, and a failing result only
    /// takes down an available instance after `unhealthy_threshold`
    /// consecutive failures. Moves within the available or within the
    /// failed group (e.g. Healthy to Warning) apply at once, as does the
    /// first verdict on an `Unknown` instance.
    pub async fn run_once(&self) -> (HealthCheckResult, Option<HealthStatusChange>) {
        let result = self.check().await;
        self.checks.fetch_add(1, Ordering::Relaxed);
        if !result.is_passing() {
            self.failed_checks.fetch_add(1, Ordering::Relaxed);
            debug!(
                instance = %self.instance.instance_id,
                status = %result.status,
                message = result.message.as_deref().unwrap_or(""),
                "Health check failed"
            );
        }
        *self.last_result.write() = Some(result.clone());

        let change = self.apply(&result);
        (result, change)
    }

    fn apply(&self, result: &HealthCheckResult) -> Option<HealthStatusChange> {
        let passing = result.is_passing();
        let (successes, failures) = self.instance.record_probe(passing);
        let current = self.instance.health();

        let flip = match (current, passing) {
            (HealthStatus::Unknown, _) => true,
            (current, true) if current.is_available() => true,
            (current, false) if !current.is_available() => true,
            (_, true) => successes >= self.config.healthy_threshold,
            (_, false) => failures >= self.config.unhealthy_threshold,
        };
        if !flip || current == result.status {
            return None;
        }

        let previous = self.instance.set_health(result.status);
        if previous == result.status {
            return None;
        }
        self.status_changes.fetch_add(1, Ordering::Relaxed);
        info!(
            service = %self.instance.service_name,
            instance = %self.instance.instance_id,
            from = %previous,
            to = %result.status,
            "Instance health changed"
        );
        Some(HealthStatusChange {
            service_name: self.instance.service_name.clone(),
            instance_id: self.instance.instance_id.clone(),
            previous,
            current: result.status,
            result: result.clone(),
            at: Utc::now(),
        })
    }

    pub fn last_result(&self) -> Option<HealthCheckResult> {
        self.last_result.read().clone()
    }

    pub fn stats(&self) -> CheckerStats {
        CheckerStats {
            checks: self.checks.load(Ordering::Relaxed),
            failed_checks: self.failed_checks.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            status_changes: self.status_changes.load(Ordering::Relaxed),
            last_result: self.last_result(),
        }
    }
}

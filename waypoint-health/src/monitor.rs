//! Background health monitoring of registered instances.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};
use waypoint_core::{ConfigResult, HealthStatus, ServiceInstance};

use crate::checker::{CheckerStats, HealthChecker};
use crate::config::HealthCheckConfig;
use crate::probes::{HealthProbe, probe_for};
use crate::result::{HealthCheckResult, HealthStatusChange};

type StatusListener = Arc<dyn Fn(&HealthStatusChange) + Send + Sync>;

struct Registration {
    checker: Arc<HealthChecker>,
    token: CancellationToken,
    running: bool,
}

struct MonitorInner {
    defaults: HealthCheckConfig,
    checkers: DashMap<String, Registration>,
    listeners: RwLock<Vec<StatusListener>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
    status_changes: AtomicU64,
    listener_panics: AtomicU64,
}

/// Monitor counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStats {
    pub registered: usize,
    pub running: usize,
    pub total_checks: u64,
    pub failed_checks: u64,
    pub status_changes: u64,
    pub listener_panics: u64,
    /// Registered instances per visible status
    pub by_status: BTreeMap<String, usize>,
}

/// Runs one independently cancellable check loop per registered instance.
///
/// Each loop checks, folds the result into the instance's visible status,
/// notifies listeners of debounced changes and sleeps for the configured
/// interval. Loops only run after [`start`](Self::start); instances
/// registered later start immediately.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(defaults: HealthCheckConfig) -> ConfigResult<Self> {
        defaults.validate()?;
        Ok(Self {
            inner: Arc::new(MonitorInner {
                defaults,
                checkers: DashMap::new(),
                listeners: RwLock::new(Vec::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                started: AtomicBool::new(false),
                status_changes: AtomicU64::new(0),
                listener_panics: AtomicU64::new(0),
            }),
        })
    }

    pub fn defaults(&self) -> &HealthCheckConfig {
        &self.inner.defaults
    }

    /// Register with the default configuration and its built-in probe.
    pub fn register(&self, instance: Arc<ServiceInstance>) -> ConfigResult<()> {
        self.register_with(instance, self.inner.defaults.clone())
    }

    /// Register with a specific configuration and its built-in probe.
    pub fn register_with(
        &self,
        instance: Arc<ServiceInstance>,
        config: HealthCheckConfig,
    ) -> ConfigResult<()> {
        let probe = probe_for(&config)?;
        self.register_with_probe(instance, config, probe)
    }

    /// Register with an explicit probe, e.g. a custom or composite one.
    ///
    /// Registering an instance id again replaces its checker.
    pub fn register_with_probe(
        &self,
        instance: Arc<ServiceInstance>,
        config: HealthCheckConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> ConfigResult<()> {
        let id = instance.instance_id.clone();
        let checker = Arc::new(HealthChecker::new(instance, config, probe)?);
        let token = self.inner.shutdown.child_token();

        if let Some(previous) = self.inner.checkers.insert(
            id.clone(),
            Registration {
                checker: Arc::clone(&checker),
                token: token.clone(),
                running: false,
            },
        ) {
            previous.token.cancel();
        }
        debug!(instance = %id, probe = %checker.config().check_type, "Registered health checker");

        if self.inner.started.load(Ordering::Acquire) {
            self.spawn_loop(&id, checker, token);
        }
        Ok(())
    }

    /// Stop and forget the checker of `instance_id`.
    pub fn deregister(&self, instance_id: &str) -> bool {
        match self.inner.checkers.remove(instance_id) {
            Some((_, registration)) => {
                registration.token.cancel();
                debug!(instance = %instance_id, "Deregistered health checker");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, instance_id: &str) -> bool {
        self.inner.checkers.contains_key(instance_id)
    }

    /// Register a listener for debounced status changes.
    pub fn on_status_change<F>(&self, listener: F)
    where
        F: Fn(&HealthStatusChange) + Send + Sync + 'static,
    {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    /// Start the check loops. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending: Vec<(String, Arc<HealthChecker>, CancellationToken)> = self
            .inner
            .checkers
            .iter()
            .filter(|r| !r.running)
            .map(|r| (r.key().clone(), Arc::clone(&r.checker), r.token.clone()))
            .collect();
        info!(checkers = pending.len(), "Starting health monitor");
        for (id, checker, token) in pending {
            self.spawn_loop(&id, checker, token);
        }
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    fn spawn_loop(&self, id: &str, checker: Arc<HealthChecker>, token: CancellationToken) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(instance = %id, "No async runtime available, health checker not started");
            return;
        };
        if let Some(mut registration) = self.inner.checkers.get_mut(id) {
            registration.running = true;
        }

        let monitor = self.clone();
        self.inner.tasks.spawn_on(
            async move {
                let interval = checker.config().interval;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        (_, change) = checker.run_once() => {
                            if let Some(change) = change {
                                monitor.notify(&change);
                            }
                        }
                    }
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                trace!(instance = %checker.instance().instance_id, "Health check loop stopped");
            },
            &handle,
        );
    }

    fn notify(&self, change: &HealthStatusChange) {
        self.inner.status_changes.fetch_add(1, Ordering::Relaxed);
        let listeners: Vec<StatusListener> = self.inner.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
                self.inner.listener_panics.fetch_add(1, Ordering::Relaxed);
                error!(
                    instance = %change.instance_id,
                    to = %change.current,
                    "Health status listener panicked"
                );
            }
        }
    }

    /// Check every registered instance once, concurrently, and return the
    /// results by instance id. Status changes are applied and notified as
    /// in the background loops.
    pub async fn check_all(&self) -> BTreeMap<String, HealthCheckResult> {
        let checkers: Vec<Arc<HealthChecker>> = self
            .inner
            .checkers
            .iter()
            .map(|r| Arc::clone(&r.checker))
            .collect();

        let runs = checkers.into_iter().map(|checker| async move {
            let (result, change) = checker.run_once().await;
            (checker.instance().instance_id.clone(), result, change)
        });

        let mut results = BTreeMap::new();
        for (id, result, change) in join_all(runs).await {
            if let Some(change) = change {
                self.notify(&change);
            }
            results.insert(id, result);
        }
        results
    }

    /// Visible status of a registered instance.
    pub fn status(&self, instance_id: &str) -> Option<HealthStatus> {
        self.inner
            .checkers
            .get(instance_id)
            .map(|r| r.checker.instance().health())
    }

    pub fn last_result(&self, instance_id: &str) -> Option<HealthCheckResult> {
        self.inner
            .checkers
            .get(instance_id)
            .and_then(|r| r.checker.last_result())
    }

    pub fn checker_stats(&self, instance_id: &str) -> Option<CheckerStats> {
        self.inner.checkers.get(instance_id).map(|r| r.checker.stats())
    }

    pub fn stats(&self) -> MonitorStats {
        let mut stats = MonitorStats {
            registered: self.inner.checkers.len(),
            status_changes: self.inner.status_changes.load(Ordering::Relaxed),
            listener_panics: self.inner.listener_panics.load(Ordering::Relaxed),
            ..Default::default()
        };
        for registration in self.inner.checkers.iter() {
            if registration.running && !registration.token.is_cancelled() {
                stats.running += 1;
            }
            let checker = registration.checker.stats();
            stats.total_checks += checker.checks;
            stats.failed_checks += checker.failed_checks;
            *stats
                .by_status
                .entry(registration.checker.instance().health().as_str().to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    /// Cancel every loop and wait up to `timeout` for them to exit.
    ///
    /// Returns `true` if every loop finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.tasks.close();

        match tokio::time::timeout(timeout, inner.tasks.wait()).await {
            Ok(()) => {
                info!("Health monitor shut down");
                true
            }
            Err(_) => {
                warn!(
                    pending = inner.tasks.len(),
                    "Health monitor shutdown timed out waiting for check loops"
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("defaults", &self.inner.defaults)
            .field("registered", &self.inner.checkers.len())
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthCheckType;
    use crate::probes::custom_probe;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use waypoint_core::ServiceEndpoint;

    fn instance(id: &str) -> Arc<ServiceInstance> {
        Arc::new(ServiceInstance::new("orders", ServiceEndpoint::new("10.0.0.1", 8080)).with_id(id))
    }

    fn custom_config() -> HealthCheckConfig {
        HealthCheckConfig::new(HealthCheckType::Custom)
            .interval(Duration::from_secs(1))
            .unhealthy_threshold(2)
            .without_circuit_breaker()
    }

    fn always(status: HealthStatus) -> Arc<dyn HealthProbe> {
        Arc::new(custom_probe("fixed", move |_| async move { status }))
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthCheckConfig::default()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_flips_status_and_notifies() {
        let monitor = monitor();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        monitor.on_status_change(move |change| sink.lock().push(change.clone()));

        let target = instance("i-1");
        monitor
            .register_with_probe(Arc::clone(&target), custom_config(), always(HealthStatus::Unhealthy))
            .unwrap();
        monitor.start();

        // First check runs at once, the second one interval later.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(target.health(), HealthStatus::Unhealthy);

        let changes = changes.lock();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].instance_id, "i-1");
        assert_eq!(changes[0].current, HealthStatus::Unhealthy);
        drop(changes);

        assert!(monitor.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_stops_loop() {
        let monitor = monitor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let probe = Arc::new(custom_probe("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { HealthStatus::Healthy }
        }));
        monitor
            .register_with_probe(instance("i-1"), custom_config(), probe)
            .unwrap();
        monitor.start();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let seen = calls.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        assert!(monitor.deregister("i-1"));
        assert!(!monitor.deregister("i-1"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_check_all_without_start() {
        let monitor = monitor();
        monitor
            .register_with_probe(instance("a"), custom_config(), always(HealthStatus::Healthy))
            .unwrap();
        monitor
            .register_with_probe(instance("b"), custom_config(), always(HealthStatus::Warning))
            .unwrap();

        let results = monitor.check_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results["a"].status, HealthStatus::Healthy);
        assert_eq!(results["b"].status, HealthStatus::Warning);

        let stats = monitor.stats();
        assert_eq!(stats.registered, 2);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.status_changes, 1);
        assert_eq!(stats.by_status["warning"], 1);
        assert_eq!(monitor.status("b"), Some(HealthStatus::Warning));
    }

    #[tokio::test]
    async fn test_panicking_listener_isolated() {
        let monitor = monitor();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        monitor.on_status_change(|_| panic!("listener bug"));
        monitor.on_status_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor
            .register_with_probe(instance("a"), custom_config(), always(HealthStatus::Warning))
            .unwrap();
        monitor.check_all().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.stats().listener_panics, 1);
    }

    #[test]
    fn test_register_rejects_custom_without_probe() {
        let monitor = monitor();
        let result = monitor.register_with(instance("a"), HealthCheckConfig::new(HealthCheckType::Custom));
        assert!(result.is_err());
        assert!(!monitor.is_registered("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registering_after_start_spawns_loop() {
        let monitor = monitor();
        monitor.start();
        let target = instance("late");
        monitor
            .register_with_probe(Arc::clone(&target), custom_config(), always(HealthStatus::Unhealthy))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(target.health(), HealthStatus::Unhealthy);
        assert_eq!(monitor.stats().running, 1);
        assert!(monitor.shutdown(Duration::from_secs(1)).await);
    }
}

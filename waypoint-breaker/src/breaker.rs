//! Circuit breaker state machine.
//!
//! ## States
//!
//! - **Closed**: calls pass through and outcomes are recorded
//! - **Open**: calls are rejected until the recovery timeout elapses
//! - **Half-Open**: a limited number of trial calls probe for recovery
//!
//! Open to half-open is evaluated lazily whenever the breaker is consulted;
//! no background task is involved. All state lives behind one lock per
//! breaker, and listeners run only after that lock is released.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use waypoint_core::ConfigResult;

use crate::config::{CircuitBreakerConfig, CircuitBreakerStrategy};
use crate::error::CircuitBreakerError;
use crate::window::{Outcome, OutcomeWindow};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub breaker: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of a breaker for metrics export.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub strategy: CircuitBreakerStrategy,
    pub state_changed_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub slow_requests: u64,
    /// Failures since the breaker last closed
    pub failures_since_closed: u64,
    pub window_size: usize,
    pub window_failure_rate: f64,
    pub half_open_requests: u32,
    pub half_open_successes: u32,
    pub recovery_attempts: u32,
    pub recovery_timeout_ms: u64,
    pub transitions: Vec<StateTransition>,
}

impl CircuitBreakerMetrics {
    /// Lifetime failure rate (0.0 - 1.0).
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

type SyncListener = Arc<dyn Fn(&StateTransition) + Send + Sync>;
type AsyncListener = Arc<dyn Fn(StateTransition) -> BoxFuture<'static, ()> + Send + Sync>;

struct BreakerState {
    state: CircuitState,
    changed_at: Instant,
    changed_at_wall: DateTime<Utc>,
    window: OutcomeWindow,
    failures_since_closed: u64,
    half_open_requests: u32,
    half_open_successes: u32,
    recovery_attempts: u32,
    recovery_timeout: Duration,
    transitions: VecDeque<StateTransition>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    slow_requests: u64,
}

/// Per-target failure tracker and gatekeeper.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    listeners: RwLock<Vec<SyncListener>>,
    async_listeners: RwLock<Vec<AsyncListener>>,
}

impl CircuitBreaker {
    /// Create a breaker, rejecting an invalid configuration.
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Arc<Self>> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    pub(crate) fn from_validated(config: CircuitBreakerConfig) -> Arc<Self> {
        info!(
            name = %config.name,
            strategy = %config.strategy,
            failure_threshold = config.failure_threshold,
            recovery_timeout = ?config.recovery_timeout,
            "Circuit breaker initialized"
        );

        Arc::new(Self {
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                changed_at: Instant::now(),
                changed_at_wall: Utc::now(),
                window: OutcomeWindow::new(config.sliding_window_size, config.time_window_size),
                failures_since_closed: 0,
                half_open_requests: 0,
                half_open_successes: 0,
                recovery_attempts: 0,
                recovery_timeout: config.recovery_timeout,
                transitions: VecDeque::new(),
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                rejected_requests: 0,
                slow_requests: 0,
            }),
            config,
            listeners: RwLock::new(Vec::new()),
            async_listeners: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, after applying any due timed transition.
    pub fn state(&self) -> CircuitState {
        let mut fired = Vec::new();
        let state = {
            let mut s = self.state.lock();
            self.evaluate(&mut s, Instant::now(), &mut fired);
            s.state
        };
        self.notify(fired);
        state
    }

    /// Whether a call would currently be let through, without taking a
    /// half-open trial slot.
    pub fn allows_requests(&self) -> bool {
        let mut fired = Vec::new();
        let allowed = {
            let mut s = self.state.lock();
            self.evaluate(&mut s, Instant::now(), &mut fired);
            match s.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => s.half_open_requests < self.config.half_open_max_calls,
            }
        };
        self.notify(fired);
        allowed
    }

    /// Admit one call, taking a trial slot when half-open.
    ///
    /// On refusal returns the state that caused it.
    pub fn try_acquire(&self) -> Result<(), CircuitState> {
        let mut fired = Vec::new();
        let verdict = {
            let mut s = self.state.lock();
            self.evaluate(&mut s, Instant::now(), &mut fired);
            let verdict = match s.state {
                CircuitState::Closed => Ok(()),
                CircuitState::Open => Err(CircuitState::Open),
                CircuitState::HalfOpen => {
                    if s.half_open_requests < self.config.half_open_max_calls {
                        s.half_open_requests += 1;
                        Ok(())
                    } else {
                        Err(CircuitState::HalfOpen)
                    }
                }
            };
            if verdict.is_err() {
                s.rejected_requests += 1;
            }
            verdict
        };
        self.notify(fired);

        if let Err(state) = verdict {
            debug!(name = %self.config.name, state = %state, "Circuit breaker rejected request");
        }
        verdict
    }

    /// Execute `f` under breaker protection.
    ///
    /// Rejected calls fail with [`CircuitBreakerError::Open`] without
    /// invoking `f`.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(state) = self.try_acquire() {
            return Err(self.open_error(state));
        }
        self.run(f).await
    }

    /// Like [`call`](Self::call), but a rejected call runs `fallback`
    /// with the refusing state instead of failing.
    ///
    /// A panicking fallback is logged and reported as the rejection.
    pub async fn call_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        f: F,
        fallback: G,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(CircuitState) -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        let state = match self.try_acquire() {
            Ok(()) => return self.run(f).await,
            Err(state) => state,
        };

        match AssertUnwindSafe(async move { fallback(state).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(CircuitBreakerError::Execution),
            Err(_) => {
                error!(name = %self.config.name, "Circuit breaker fallback panicked");
                Err(self.open_error(state))
            }
        }
    }

    async fn run<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let result = f().await;
        let elapsed = start.elapsed();

        match result {
            Ok(value) => {
                self.record_success(elapsed);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(elapsed);
                Err(CircuitBreakerError::Execution(e))
            }
        }
    }

    fn open_error<E>(&self, state: CircuitState) -> CircuitBreakerError<E> {
        CircuitBreakerError::Open {
            name: self.config.name.clone(),
            state,
        }
    }

    /// Record a successful call that took `elapsed`.
    pub fn record_success(&self, elapsed: Duration) {
        self.record(true, elapsed);
    }

    /// Record a failed call that took `elapsed`.
    pub fn record_failure(&self, elapsed: Duration) {
        self.record(false, elapsed);
    }

    fn record(&self, success: bool, elapsed: Duration) {
        let now = Instant::now();
        let slow = elapsed > self.config.response_time_threshold;
        let mut fired = Vec::new();

        {
            let mut s = self.state.lock();
            self.evaluate(&mut s, now, &mut fired);

            s.total_requests += 1;
            if success {
                s.successful_requests += 1;
            } else {
                s.failed_requests += 1;
            }
            if slow {
                s.slow_requests += 1;
            }

            match s.state {
                CircuitState::Closed => {
                    s.window.push(Outcome {
                        at: now,
                        success,
                        slow,
                    });
                    if !success {
                        s.failures_since_closed += 1;
                    }
                    if let Some(reason) = self.trip_reason(&s) {
                        self.transition(&mut s, CircuitState::Open, reason, now, &mut fired);
                    }
                }
                CircuitState::HalfOpen if !success => {
                    self.transition(
                        &mut s,
                        CircuitState::Open,
                        "failure while half-open".to_string(),
                        now,
                        &mut fired,
                    );
                }
                CircuitState::HalfOpen => {
                    s.half_open_successes += 1;
                    s.half_open_requests = s.half_open_requests.max(s.half_open_successes);
                    if s.half_open_successes >= self.config.success_threshold {
                        let reason = format!("{} successful trial calls", s.half_open_successes);
                        self.transition(&mut s, CircuitState::Closed, reason, now, &mut fired);
                    } else if s.half_open_requests >= self.config.half_open_max_calls
                        && s.half_open_successes >= s.half_open_requests
                    {
                        self.transition(
                            &mut s,
                            CircuitState::Open,
                            "trial calls exhausted below success threshold".to_string(),
                            now,
                            &mut fired,
                        );
                    }
                }
                CircuitState::Open => {
                    debug!(name = %self.config.name, success, "Outcome recorded while circuit open");
                }
            }
        }

        self.notify(fired);
    }

    fn trip_reason(&self, s: &BreakerState) -> Option<String> {
        let config = &self.config;
        match config.strategy {
            CircuitBreakerStrategy::FailureCount => (s.failures_since_closed
                >= config.failure_threshold as u64)
                .then(|| format!("{} failures", s.failures_since_closed)),
            CircuitBreakerStrategy::FailureRate => {
                let rate = s.window.failure_rate();
                (s.window.len() >= config.minimum_request_threshold as usize
                    && rate >= config.failure_rate_threshold)
                    .then(|| format!("failure rate {:.2} over {} calls", rate, s.window.len()))
            }
            CircuitBreakerStrategy::ResponseTime => {
                let slow = s.window.slow_calls();
                (slow >= config.slow_request_threshold as usize)
                    .then(|| format!("{} slow calls", slow))
            }
        }
    }

    /// Apply transitions that depend only on elapsed time.
    fn evaluate(&self, s: &mut BreakerState, now: Instant, fired: &mut Vec<StateTransition>) {
        let in_state = now.saturating_duration_since(s.changed_at);
        match s.state {
            CircuitState::Open if in_state >= s.recovery_timeout => {
                let reason = format!("recovery timeout {:?} elapsed", s.recovery_timeout);
                self.transition(s, CircuitState::HalfOpen, reason, now, fired);
            }
            CircuitState::HalfOpen if in_state > self.config.half_open_timeout => {
                self.transition(
                    s,
                    CircuitState::Open,
                    "half-open timeout exceeded".to_string(),
                    now,
                    fired,
                );
            }
            CircuitState::Closed => s.window.prune(now),
            _ => {}
        }
    }

    fn transition(
        &self,
        s: &mut BreakerState,
        to: CircuitState,
        reason: String,
        now: Instant,
        fired: &mut Vec<StateTransition>,
    ) {
        let from = s.state;
        s.state = to;
        s.changed_at = now;
        s.changed_at_wall = Utc::now();

        match to {
            CircuitState::Open => {
                s.recovery_attempts = s.recovery_attempts.saturating_add(1);
                s.recovery_timeout = self.config.recovery_timeout_for(s.recovery_attempts);
                warn!(
                    name = %self.config.name,
                    from = %from,
                    reason = %reason,
                    attempt = s.recovery_attempts,
                    recovery_timeout = ?s.recovery_timeout,
                    "Circuit breaker OPENED"
                );
            }
            CircuitState::HalfOpen => {
                s.half_open_requests = 0;
                s.half_open_successes = 0;
                info!(name = %self.config.name, reason = %reason, "Circuit breaker HALF-OPEN");
            }
            CircuitState::Closed => {
                s.recovery_attempts = 0;
                s.recovery_timeout = self.config.recovery_timeout;
                s.failures_since_closed = 0;
                s.window.clear();
                info!(name = %self.config.name, from = %from, reason = %reason, "Circuit breaker CLOSED");
            }
        }

        let record = StateTransition {
            breaker: self.config.name.clone(),
            from,
            to,
            reason,
            at: s.changed_at_wall,
        };
        if self.config.transition_log_size > 0 {
            if s.transitions.len() == self.config.transition_log_size {
                s.transitions.pop_front();
            }
            s.transitions.push_back(record.clone());
        }
        fired.push(record);
    }

    /// Run listeners for transitions decided under the lock.
    fn notify(&self, fired: Vec<StateTransition>) {
        if fired.is_empty() {
            return;
        }

        let listeners = self.listeners.read().clone();
        let async_listeners = self.async_listeners.read().clone();

        for transition in fired {
            for listener in &listeners {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| listener(&transition)));
                if outcome.is_err() {
                    error!(name = %self.config.name, to = %transition.to, "State change listener panicked");
                }
            }

            if async_listeners.is_empty() {
                continue;
            }
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!(name = %self.config.name, "No async runtime, skipping async state change listeners");
                continue;
            };
            for listener in &async_listeners {
                let fut = listener(transition.clone());
                let name = self.config.name.clone();
                handle.spawn(async move {
                    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                        error!(name = %name, "Async state change listener panicked");
                    }
                });
            }
        }
    }

    /// Register a listener run synchronously on every state change.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Register a listener spawned onto the runtime on every state change.
    pub fn on_state_change_async<F, Fut>(&self, listener: F)
    where
        F: Fn(StateTransition) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.async_listeners
            .write()
            .push(Arc::new(move |t| listener(t).boxed()));
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let mut fired = Vec::new();
        {
            let mut s = self.state.lock();
            let now = Instant::now();
            if s.state == CircuitState::Closed {
                s.failures_since_closed = 0;
                s.window.clear();
                s.recovery_attempts = 0;
            } else {
                self.transition(&mut s, CircuitState::Closed, "manual reset".to_string(), now, &mut fired);
            }
        }
        self.notify(fired);
    }

    /// Force the breaker open.
    pub fn force_open(&self) {
        let mut fired = Vec::new();
        {
            let mut s = self.state.lock();
            if s.state != CircuitState::Open {
                self.transition(
                    &mut s,
                    CircuitState::Open,
                    "forced open".to_string(),
                    Instant::now(),
                    &mut fired,
                );
            }
        }
        self.notify(fired);
    }

    /// Most recent transitions, oldest first.
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.state.lock().transitions.iter().cloned().collect()
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut fired = Vec::new();
        let metrics = {
            let mut s = self.state.lock();
            self.evaluate(&mut s, Instant::now(), &mut fired);
            CircuitBreakerMetrics {
                name: self.config.name.clone(),
                state: s.state,
                strategy: self.config.strategy,
                state_changed_at: s.changed_at_wall,
                total_requests: s.total_requests,
                successful_requests: s.successful_requests,
                failed_requests: s.failed_requests,
                rejected_requests: s.rejected_requests,
                slow_requests: s.slow_requests,
                failures_since_closed: s.failures_since_closed,
                window_size: s.window.len(),
                window_failure_rate: s.window.failure_rate(),
                half_open_requests: s.half_open_requests,
                half_open_successes: s.half_open_successes,
                recovery_attempts: s.recovery_attempts,
                recovery_timeout_ms: s.recovery_timeout.as_millis() as u64,
                transitions: s.transitions.iter().cloned().collect(),
            }
        };
        self.notify(fired);
        metrics
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.state.lock().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        CircuitBreaker::new(config).unwrap()
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.call(|| async { Err("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_failure_count_trips_and_rejects() {
        let cb = breaker(CircuitBreakerConfig::new("orders").failure_threshold(5));

        for _ in 0..4 {
            assert!(matches!(fail(&cb).await, Err(CircuitBreakerError::Execution("boom"))));
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result: Result<(), CircuitBreakerError<&str>> = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(CircuitBreakerError::Open { state: CircuitState::Open, .. })
        ));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.metrics().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_failure_count_is_cumulative_while_closed() {
        let cb = breaker(CircuitBreakerConfig::new("orders").failure_threshold(3));
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_through_half_open() {
        let cb = breaker(
            CircuitBreakerConfig::new("orders")
                .failure_threshold(5)
                .recovery_timeout(Duration::from_secs(1))
                .exponential_backoff(false)
                .success_threshold(3),
        );
        for _ in 0..5 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(succeed(&cb).await.unwrap_err().is_open());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(succeed(&cb).await.is_ok());
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);

        let states: Vec<CircuitState> = cb.transitions().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_backoff() {
        let cb = breaker(
            CircuitBreakerConfig::new("orders")
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(1))
                .backoff_multiplier(2.0)
                .max_recovery_timeout(Duration::from_secs(10)),
        );
        let _ = fail(&cb).await;
        assert_eq!(cb.metrics().recovery_timeout_ms, 1000);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().recovery_attempts, 2);
        assert_eq!(cb.metrics().recovery_timeout_ms, 2000);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_slots_are_limited() {
        let cb = breaker(
            CircuitBreakerConfig::new("orders")
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(1))
                .exponential_backoff(false)
                .success_threshold(2)
                .half_open_max_calls(2),
        );
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.try_acquire(), Err(CircuitState::HalfOpen));
        assert!(!cb.allows_requests());

        cb.record_success(Duration::from_millis(5));
        cb.record_success(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_timeout_reopens() {
        let cb = breaker(
            CircuitBreakerConfig::new("orders")
                .failure_threshold(1)
                .recovery_timeout(Duration::from_secs(1))
                .exponential_backoff(false)
                .half_open_timeout(Duration::from_secs(5)),
        );
        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_failure_rate_needs_minimum_requests() {
        let cb = breaker(
            CircuitBreakerConfig::new("orders")
                .strategy(CircuitBreakerStrategy::FailureRate)
                .failure_rate_threshold(0.5)
                .minimum_request_threshold(4),
        );
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        let _ = succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_failure_rate_below_threshold_stays_closed() {
        let cb = breaker(
            CircuitBreakerConfig::new("orders")
                .strategy(CircuitBreakerStrategy::FailureRate)
                .failure_rate_threshold(0.5)
                .minimum_request_threshold(4),
        );
        for _ in 0..3 {
            let _ = succeed(&cb).await;
        }
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!((cb.metrics().window_failure_rate - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_response_time_strategy_counts_slow_calls() {
        let cb = breaker(
            CircuitBreakerConfig::new("orders")
                .strategy(CircuitBreakerStrategy::ResponseTime)
                .response_time_threshold(Duration::from_millis(100))
                .slow_request_threshold(2),
        );
        cb.record_success(Duration::from_millis(250));
        cb.record_success(Duration::from_millis(50));
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_success(Duration::from_millis(300));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().slow_requests, 2);
    }

    #[tokio::test]
    async fn test_fallback_used_when_open() {
        let cb = breaker(CircuitBreakerConfig::new("orders").failure_threshold(1));
        let _ = fail(&cb).await;

        let result: Result<&str, CircuitBreakerError<&str>> = cb
            .call_with_fallback(
                || async { Ok("primary") },
                |state| async move {
                    assert_eq!(state, CircuitState::Open);
                    Ok("cached")
                },
            )
            .await;
        assert_eq!(result.unwrap(), "cached");
    }

    async fn broken_fallback(_: CircuitState) -> Result<(), &'static str> {
        panic!("fallback broke")
    }

    #[tokio::test]
    async fn test_panicking_fallback_reports_open() {
        let cb = breaker(CircuitBreakerConfig::new("orders").failure_threshold(1));
        let _ = fail(&cb).await;

        let result: Result<(), CircuitBreakerError<&str>> = cb
            .call_with_fallback(|| async { Ok(()) }, broken_fallback)
            .await;
        assert!(result.unwrap_err().is_open());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_listeners_and_panics_are_isolated() {
        let cb = breaker(CircuitBreakerConfig::new("orders").failure_threshold(1));
        let seen = Arc::new(AtomicUsize::new(0));

        cb.on_state_change(|_| panic!("listener broke"));
        let counter = Arc::clone(&seen);
        cb.on_state_change(move |t| {
            assert_eq!(t.breaker, "orders");
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_listener_receives_transition() {
        let cb = breaker(CircuitBreakerConfig::new("orders").failure_threshold(1));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        cb.on_state_change_async(move |t| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(t.to);
            }
        });

        let _ = fail(&cb).await;
        assert_eq!(rx.recv().await, Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_reset_and_force_open() {
        let cb = breaker(CircuitBreakerConfig::new("orders"));
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allows_requests());

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().recovery_attempts, 0);
        assert!(succeed(&cb).await.is_ok());
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        assert!(CircuitBreaker::new(CircuitBreakerConfig::new("x").success_threshold(0)).is_err());

        // Three successes can never fit into two trial calls.
        let unreachable = CircuitBreakerConfig::new("x")
            .success_threshold(3)
            .half_open_max_calls(2);
        assert!(CircuitBreaker::new(unreachable).is_err());
        let exact = CircuitBreakerConfig::new("x")
            .success_threshold(2)
            .half_open_max_calls(2);
        assert!(CircuitBreaker::new(exact).is_ok());
    }
}

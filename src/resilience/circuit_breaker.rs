//! Circuit breaker for calls to a failing dependency.
//!
//! ```text
//! CLOSED --failure_threshold failures--> OPEN --timeout elapsed--> HALF_OPEN
//!   ^                                     ^                            |
//!   |                                     +------- any failure --------+
//!   +------------ success_threshold consecutive successes -------------+
//! ```
//!
//! While OPEN, calls are rejected with [`Error::CircuitOpen`] without running
//! the wrapped operation.

use crate::error::Error;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED before opening.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive HALF_OPEN successes before closing.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Cooldown spent OPEN before a probe is allowed.
    #[serde(default = "default_timeout", with = "crate::config::duration_str")]
    pub timeout: Duration,

    /// Quiet period after which the CLOSED failure count starts over.
    #[serde(default = "default_reset_timeout", with = "crate::config::duration_str")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout: default_timeout(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the cooldown elapses.
    Open,
    /// Probe calls are let through to test recovery.
    HalfOpen,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Time left before an OPEN breaker admits a probe.
    pub retry_after_ms: Option<u64>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    total_calls: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
    times_opened: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            total_calls: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejections: 0,
            times_opened: 0,
        }
    }
}

/// One breaker guarding one named resource.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker.
    ///
    /// Any `Err` from the operation counts as a failure. Rejected calls
    /// return [`Error::CircuitOpen`] converted into `E`.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        self.before_call().map_err(E::from)?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Admission check; moves OPEN to HALF_OPEN once the cooldown is over.
    fn before_call(&self) -> Result<(), Error> {
        let mut s = self.inner.lock();
        s.total_calls += 1;

        if s.state == CircuitState::Open {
            let now = Instant::now();
            match s.next_attempt_at {
                Some(at) if now < at => {
                    s.total_rejections += 1;
                    return Err(Error::CircuitOpen {
                        name: self.name.clone(),
                        retry_after: at - now,
                    });
                }
                _ => {
                    s.state = CircuitState::HalfOpen;
                    s.success_count = 0;
                    tracing::info!(breaker = %self.name, "Circuit breaker half-open, probing");
                }
            }
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut s = self.inner.lock();
        s.total_successes += 1;

        match s.state {
            CircuitState::HalfOpen => {
                s.success_count += 1;
                if s.success_count >= self.config.success_threshold {
                    s.state = CircuitState::Closed;
                    s.failure_count = 0;
                    s.success_count = 0;
                    s.last_failure_at = None;
                    s.next_attempt_at = None;
                    tracing::info!(breaker = %self.name, "Circuit breaker closed");
                }
            }
            CircuitState::Closed => {
                s.failure_count = 0;
            }
            // A call admitted before another caller opened the breaker
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut s = self.inner.lock();
        let now = Instant::now();
        s.total_failures += 1;

        match s.state {
            CircuitState::Closed => {
                let quiet = s
                    .last_failure_at
                    .map(|at| now.duration_since(at) > self.config.reset_timeout)
                    .unwrap_or(false);
                s.failure_count = if quiet { 1 } else { s.failure_count + 1 };
                s.last_failure_at = Some(now);

                if s.failure_count >= self.config.failure_threshold {
                    self.open(&mut s, now);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = s.failure_count,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                s.last_failure_at = Some(now);
                self.open(&mut s, now);
                tracing::warn!(breaker = %self.name, "Circuit breaker probe failed, reopening");
            }
            CircuitState::Open => {
                s.last_failure_at = Some(now);
            }
        }
    }

    fn open(&self, s: &mut BreakerState, now: Instant) {
        s.state = CircuitState::Open;
        s.success_count = 0;
        s.next_attempt_at = Some(now + self.config.timeout);
        s.times_opened += 1;
    }

    /// Current state. An OPEN breaker whose cooldown is over still reports
    /// OPEN until the next call moves it to HALF_OPEN.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let s = self.inner.lock();
        let now = Instant::now();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: s.state,
            failure_count: s.failure_count,
            success_count: s.success_count,
            retry_after_ms: match (s.state, s.next_attempt_at) {
                (CircuitState::Open, Some(at)) => {
                    Some(at.saturating_duration_since(now).as_millis() as u64)
                }
                _ => None,
            },
            total_calls: s.total_calls,
            total_failures: s.total_failures,
            total_successes: s.total_successes,
            total_rejections: s.total_rejections,
            times_opened: s.times_opened,
        }
    }

    /// Force CLOSED and clear counters (lifetime totals are kept).
    pub fn reset(&self) {
        let mut s = self.inner.lock();
        s.state = CircuitState::Closed;
        s.failure_count = 0;
        s.success_count = 0;
        s.last_failure_at = None;
        s.next_attempt_at = None;
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Force OPEN for one cooldown period.
    pub fn trip(&self) {
        let mut s = self.inner.lock();
        self.open(&mut s, Instant::now());
        tracing::warn!(breaker = %self.name, "Circuit breaker tripped manually");
    }
}

/// One breaker per resource name, created on first use.
#[derive(Default)]
pub struct CircuitBreakerManager {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for `name`, created with the default config if missing.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_with_config(name, self.default_config.clone())
    }

    /// Breaker for `name`, created with `config` if missing. An existing
    /// breaker keeps its original config.
    pub fn get_with_config(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    /// Run `operation` through the breaker named `name`.
    pub async fn call<F, Fut, T, E>(&self, name: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        self.get(name).call(operation).await
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut all: Vec<_> = self.breakers.read().values().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        self.breakers.write().remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async {
                Err(Error::UpstreamStatus {
                    service: "stt".to_string(),
                    status: 503,
                })
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32> {
        breaker.call(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let breaker = CircuitBreaker::new("stt", config());
        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result: Result<()> = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.snapshot().total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_successes_close() {
        let breaker = CircuitBreaker::new("stt", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("stt", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(Error::CircuitOpen { .. })));
        assert_eq!(breaker.snapshot().times_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn still_open_before_timeout() {
        let breaker = CircuitBreaker::new("stt", config());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(9)).await;
        match succeed(&breaker).await {
            Err(Error::CircuitOpen { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(1))
            }
            other => panic!("expected CircuitOpen, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_resets_count() {
        let breaker = CircuitBreaker::new("stt", config());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_restarts_failure_count() {
        let breaker = CircuitBreaker::new("stt", config());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trip_and_reset() {
        let breaker = CircuitBreaker::new("llm", config());
        breaker.trip();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.snapshot().retry_after_ms.is_some());
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker).await.unwrap();
    }

    #[test]
    fn manager_reuses_breakers_per_name() {
        let manager = CircuitBreakerManager::new(config());
        let a = manager.get("service-stt");
        let b = manager.get("service-stt");
        assert!(Arc::ptr_eq(&a, &b));

        let custom = CircuitBreakerConfig {
            failure_threshold: 1,
            ..config()
        };
        let c = manager.get_with_config("service-tts", custom.clone());
        assert_eq!(c.config(), &custom);
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.snapshots()[0].name, "service-stt");

        assert!(manager.remove("service-tts"));
        assert!(!manager.remove("service-tts"));
    }
}

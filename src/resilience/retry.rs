//! Retry with capped exponential backoff and jitter.

use crate::error::Error;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_factor() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.3
}

/// Backoff policy.
///
/// The delay before retry `k` (0-based) is `min(initial_delay * factor^k,
/// max_delay)` plus a random extra of up to `jitter` times that delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay", with = "crate::config::duration_str")]
    pub initial_delay: Duration,

    #[serde(default = "default_max_delay", with = "crate::config::duration_str")]
    pub max_delay: Duration,

    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Fraction in [0, 1].
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            factor: default_factor(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Same policy with a different retry count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry `attempt` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let delay = self.initial_delay.as_secs_f64() * exp;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Delay before retry `attempt` with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=jitter);
        base + base.mul_f64(extra)
    }
}

/// Classifies errors as transient.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        Error::is_retryable(self)
    }
}

type RetryHook<E> = Arc<dyn Fn(&E, u32, Duration) + Send + Sync>;

/// Retry runner.
///
/// ```no_run
/// use hostmesh::resilience::{Retry, RetryPolicy};
///
/// # async fn example() -> hostmesh::Result<()> {
/// let _body = Retry::new(RetryPolicy::default())
///     .on_retry(|err: &hostmesh::Error, attempt, delay| {
///         tracing::warn!("attempt {} failed ({}), retrying in {:?}", attempt, err, delay);
///     })
///     .run(|| async { Ok::<_, hostmesh::Error>("pong") })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Retry<E> {
    policy: RetryPolicy,
    hook: Option<RetryHook<E>>,
}

impl<E: Retryable + std::fmt::Display> Retry<E> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, hook: None }
    }

    /// Called before each retry with the error, the 1-based attempt that
    /// failed, and the delay about to be slept.
    pub fn on_retry(mut self, hook: impl Fn(&E, u32, Duration) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Run `op`, retrying transient failures up to `max_retries` times.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retries = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retries < self.policy.max_retries && e.is_retryable() => {
                    let delay = self.policy.delay_for(retries);
                    retries += 1;
                    tracing::debug!(
                        attempt = retries,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after transient error: {}",
                        e
                    );
                    if let Some(hook) = &self.hook {
                        hook(&e, retries, delay);
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Shorthand for `Retry::new(policy).run(op)`.
pub async fn retry<F, Fut, T, E>(policy: RetryPolicy, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    Retry::new(policy).run(op).await
}

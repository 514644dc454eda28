//! Health probes for registered service instances.

mod http;

pub use http::{validate_url, HttpProbe};
pub(crate) use http::shared_client;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// Answers "is the endpoint at `url` healthy right now?".
///
/// Implementations never error: timeouts and connection failures are
/// simply unhealthy.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> bool;
}

/// Poll `url` until it is healthy, using exponential backoff.
/// Starts with `interval` and doubles each retry up to a maximum of 30 seconds.
pub async fn wait_until_healthy<P: HealthProbe + ?Sized>(
    probe: &P,
    url: &str,
    timeout: Duration,
    max_attempts: usize,
    interval: Duration,
) -> bool {
    let mut current_delay = interval;
    let max_delay = Duration::from_secs(30);

    for attempt in 0..max_attempts {
        if probe.probe(url, timeout).await {
            return true;
        }
        // Don't sleep after the last attempt
        if attempt + 1 < max_attempts {
            sleep(current_delay).await;
            current_delay = std::cmp::min(current_delay * 2, max_delay);
        }
    }
    false
}

/// Probe with scripted answers, for tests and embedders without HTTP.
///
/// Unknown URLs answer `default`. An optional delay simulates slow endpoints.
pub struct StaticProbe {
    answers: RwLock<HashMap<String, bool>>,
    default: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub fn new(default: bool) -> Self {
        Self {
            answers: RwLock::new(HashMap::new()),
            default,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set(&self, url: impl Into<String>, healthy: bool) {
        self.answers.write().insert(url.into(), healthy);
    }

    /// Number of probes performed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, url: &str, _timeout: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        self.answers.read().get(url).copied().unwrap_or(self.default)
    }
}

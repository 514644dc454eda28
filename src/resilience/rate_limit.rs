//! Sliding-window rate limiter keyed by caller.
//!
//! Each key keeps the timestamps of its admitted requests inside the current
//! window. A request is admitted while fewer than `max_requests` timestamps
//! remain after pruning. Keys that go quiet for a whole window are evicted by
//! [`RateLimiter::evict_inactive`] (or the background sweeper) so memory stays
//! bounded by the set of recently active callers.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn default_window() -> Duration {
    Duration::from_secs(60)
}

fn default_max_requests() -> usize {
    100
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window", with = "crate::config::duration_str")]
    pub window: Duration,

    /// Requests admitted per key per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// How often the background sweeper evicts idle keys.
    #[serde(default = "default_sweep_interval", with = "crate::config::duration_str")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            max_requests: default_max_requests(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: usize,
    /// Requests still admissible in the current window.
    pub remaining: usize,
    /// Time until the oldest counted request leaves the window.
    pub reset_in: Duration,
}

#[derive(Debug)]
struct Window {
    requests: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.requests.front() {
            if oldest + window <= now {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    fn reset_in(&self, now: Instant, window: Duration) -> Duration {
        self.requests
            .front()
            .map(|&oldest| (oldest + window).saturating_duration_since(now))
            .unwrap_or(window)
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Default key for a caller on a channel: `<channel>:<ip>`.
    pub fn caller_key(channel: &str, ip: IpAddr) -> String {
        format!("{}:{}", channel, ip)
    }

    /// Admission check for `key`; an admitted request is recorded.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let window_len = self.config.window;
        let limit = self.config.max_requests;

        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_insert_with(|| Window {
            requests: VecDeque::new(),
        });
        window.prune(now, window_len);

        if window.requests.len() < limit {
            window.requests.push_back(now);
            RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit - window.requests.len(),
                reset_in: window.reset_in(now, window_len),
            }
        } else {
            let reset_in = window.reset_in(now, window_len);
            tracing::warn!(
                key,
                requests = window.requests.len(),
                max = limit,
                "Rate limit exceeded"
            );
            RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_in,
            }
        }
    }

    pub fn check_caller(&self, channel: &str, ip: IpAddr) -> RateLimitDecision {
        self.check(&Self::caller_key(channel, ip))
    }

    /// Like [`check`](Self::check) but rejects with [`Error::RateLimited`].
    /// Rejected callers are never retried here.
    pub fn acquire(&self, key: &str) -> Result<RateLimitDecision> {
        let decision = self.check(key);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(Error::RateLimited {
                key: key.to_string(),
                limit: decision.limit,
                retry_after: decision.reset_in,
            })
        }
    }

    /// Drop keys with no request inside the current window.
    pub fn evict_inactive(&self) -> usize {
        let now = Instant::now();
        let window_len = self.config.window;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| {
            w.prune(now, window_len);
            !w.requests.is_empty()
        });
        let evicted = before - windows.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = windows.len(), "Evicted idle rate limit keys");
        }
        evicted
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    /// Evict idle keys every `sweep_interval` until `token` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {
                        limiter.evict_inactive();
                    }
                }
            }
        })
    }
}

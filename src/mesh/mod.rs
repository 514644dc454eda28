//! Service-to-service calls over the registry.
//!
//! [`ServiceMeshClient::call_service`] resolves an instance through the
//! [`ServiceRegistry`], performs the HTTP request, and wraps it either in the
//! per-service circuit breaker (`service-<name>`) or in [`Retry`]. Every
//! call's latency and outcome land in per-service [`CallStats`].

mod bulkhead;

pub use bulkhead::BulkheadStatus;

use crate::error::{Error, Result};
use crate::healthcheck::shared_client;
use crate::registry::{GetServiceOptions, SelectionStrategy, ServiceRegistry};
use crate::resilience::{CircuitBreakerManager, Retry, RetryPolicy};
use bulkhead::Bulkhead;
use parking_lot::Mutex;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retries() -> u32 {
    3
}

fn default_use_circuit_breaker() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshClientConfig {
    /// Per-request timeout when a call does not set one.
    #[serde(default = "default_timeout", with = "crate::config::duration_str")]
    pub default_timeout: Duration,

    /// Retries for calls that bypass the circuit breaker.
    #[serde(default = "default_retries")]
    pub default_retries: u32,

    #[serde(default = "default_use_circuit_breaker")]
    pub use_circuit_breaker: bool,

    /// Waiting callers allowed per bulkhead before rejecting. Unbounded when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bulkhead_max_queue: Option<usize>,
}

impl Default for MeshClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            default_retries: default_retries(),
            use_circuit_breaker: default_use_circuit_breaker(),
            bulkhead_max_queue: None,
        }
    }
}

/// Per-call options.
///
/// # Examples
///
/// ```
/// use hostmesh::mesh::CallOptions;
/// use std::time::Duration;
///
/// let opts = CallOptions::post("/v1/transcribe", serde_json::json!({"lang": "en"}))
///     .header("x-request-id", "42")
///     .timeout(Duration::from_secs(5))
///     .retries(1);
/// assert_eq!(opts.path, "/v1/transcribe");
/// ```
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: BTreeMap<String, String>,
    /// Overrides `default_retries` when the breaker is bypassed.
    pub retries: Option<u32>,
    pub timeout: Option<Duration>,
    pub strategy: SelectionStrategy,
    /// Overrides `use_circuit_breaker`.
    pub circuit_breaker: Option<bool>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            path: "/".to_string(),
            body: None,
            headers: BTreeMap::new(),
            retries: None,
            timeout: None,
            strategy: SelectionStrategy::RoundRobin,
            circuit_breaker: None,
        }
    }
}

impl CallOptions {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn circuit_breaker(mut self, enabled: bool) -> Self {
        self.circuit_breaker = Some(enabled);
        self
    }
}

/// Successful (2xx) response from a service.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    pub status: u16,
    pub instance_id: String,
    pub body: Vec<u8>,
    pub latency: Duration,
}

impl ServiceResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Call counters for one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls refused by an open breaker.
    pub rejections: u64,
    pub total_latency_ms: u64,
    pub last_latency_ms: u64,
}

impl CallStats {
    pub fn average_latency_ms(&self) -> u64 {
        if self.calls == 0 {
            0
        } else {
            self.total_latency_ms / self.calls
        }
    }
}

pub struct ServiceMeshClient {
    registry: ServiceRegistry,
    breakers: Arc<CircuitBreakerManager>,
    retry_policy: RetryPolicy,
    config: MeshClientConfig,
    client: reqwest::Client,
    stats: Mutex<HashMap<String, CallStats>>,
    bulkheads: Mutex<HashMap<String, Arc<Bulkhead>>>,
}

impl ServiceMeshClient {
    pub fn new(
        registry: ServiceRegistry,
        breakers: Arc<CircuitBreakerManager>,
        retry_policy: RetryPolicy,
        config: MeshClientConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            retry_policy,
            config,
            client: shared_client().clone(),
            stats: Mutex::new(HashMap::new()),
            bulkheads: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Call `name` with `options`. Non-2xx responses are errors.
    pub async fn call_service(&self, name: &str, options: CallOptions) -> Result<ServiceResponse> {
        let started = Instant::now();
        let use_breaker = options
            .circuit_breaker
            .unwrap_or(self.config.use_circuit_breaker);

        let result = if use_breaker {
            let breaker = self.breakers.get(&format!("service-{}", name));
            breaker.call(|| self.attempt(name, &options)).await
        } else {
            let retries = options.retries.unwrap_or(self.config.default_retries);
            let service = name.to_string();
            Retry::new(self.retry_policy.clone().with_max_retries(retries))
                .on_retry(move |err: &Error, attempt, delay| {
                    tracing::warn!(
                        service = %service,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Service call failed, retrying: {}",
                        err
                    );
                })
                .run(|| self.attempt(name, &options))
                .await
        };

        self.record(name, &result, started.elapsed());
        result
    }

    async fn attempt(&self, name: &str, options: &CallOptions) -> Result<ServiceResponse> {
        let instance = self
            .registry
            .get_service(name, GetServiceOptions::with_strategy(options.strategy))
            .ok_or_else(|| {
                if self.registry.get_instances(name).is_empty() {
                    Error::ServiceNotFound(name.to_string())
                } else {
                    Error::NoHealthyInstance(name.to_string())
                }
            })?;

        let path = if options.path.starts_with('/') {
            options.path.clone()
        } else {
            format!("/{}", options.path)
        };
        let url = format!("{}{}", instance.base_url(), path);
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);

        let mut request = self
            .client
            .request(options.method.clone(), &url)
            .timeout(timeout);
        for (key, value) in &options.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    operation: format!("{} {}", options.method, url),
                    after: timeout,
                }
            } else {
                Error::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(
                service = %name,
                instance_id = %instance.id,
                status = status.as_u16(),
                "Service returned error status"
            );
            return Err(Error::UpstreamStatus {
                service: name.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?.to_vec();
        Ok(ServiceResponse {
            status: status.as_u16(),
            instance_id: instance.id,
            body,
            latency: started.elapsed(),
        })
    }

    fn record(&self, name: &str, result: &Result<ServiceResponse>, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        let mut stats = self.stats.lock();
        let entry = stats.entry(name.to_string()).or_default();
        entry.calls += 1;
        entry.total_latency_ms += latency_ms;
        entry.last_latency_ms = latency_ms;
        match result {
            Ok(_) => entry.successes += 1,
            Err(Error::CircuitOpen { .. }) => entry.rejections += 1,
            Err(_) => entry.failures += 1,
        }
    }

    /// Run `operation` with at most `max_concurrency` concurrent calls per
    /// `name`. Excess callers wait in FIFO order; with `bulkhead_max_queue`
    /// set, callers beyond the queue bound get [`Error::BulkheadFull`].
    ///
    /// The first call for a name fixes its concurrency limit.
    pub async fn call_with_bulkhead<F, Fut, T>(
        &self,
        name: &str,
        max_concurrency: usize,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let bulkhead = {
            let mut bulkheads = self.bulkheads.lock();
            Arc::clone(bulkheads.entry(name.to_string()).or_insert_with(|| {
                Arc::new(Bulkhead::new(
                    name,
                    max_concurrency.max(1),
                    self.config.bulkhead_max_queue,
                ))
            }))
        };

        let _permit = bulkhead.enter().await?;
        operation().await
    }

    pub fn bulkhead_status(&self, name: &str) -> Option<BulkheadStatus> {
        self.bulkheads.lock().get(name).map(|b| b.status())
    }

    pub fn stats(&self, name: &str) -> Option<CallStats> {
        self.stats.lock().get(name).cloned()
    }

    pub fn all_stats(&self) -> BTreeMap<String, CallStats> {
        self.stats
            .lock()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect()
    }
}

use crate::aggregator::AggregatorConfig;
use crate::error::{Error, Result};
use crate::instance::{InstanceConfig, PortLayout};
use crate::mesh::MeshClientConfig;
use crate::port::ShieldConfig;
use crate::registry::RegistryConfig;
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_app_name() -> String {
    "hostmesh".to_string()
}

/// Top-level configuration for the coordination layer.
///
/// Every section has defaults, so an empty YAML document is a valid config:
///
/// ```yaml
/// app_name: voice-assistant
/// ports:
///   base_port: 6000
///   pools:
///     primary: { offset: 0, size: 3 }
/// circuit_breaker:
///   failure_threshold: 5
///   timeout: "60s"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Prefix for the shared lock directories (`<app>-ports`, `<app>-instances`).
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Directory holding the lock directories. Defaults to the OS temp dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_root: Option<PathBuf>,

    #[serde(default)]
    pub instances: InstanceConfig,

    #[serde(default)]
    pub ports: PortLayout,

    #[serde(default)]
    pub shield: ShieldConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub mesh: MeshClientConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            lock_root: None,
            instances: InstanceConfig::default(),
            ports: PortLayout::default(),
            shield: ShieldConfig::default(),
            registry: RegistryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            mesh: MeshClientConfig::default(),
            aggregator: AggregatorConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Resolved lock root directory.
    pub fn lock_root(&self) -> PathBuf {
        self.lock_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty()
            || !self
                .app_name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Validation(format!(
                "app_name '{}' must be non-empty and contain only alphanumeric, '-' or '_'",
                self.app_name
            )));
        }

        if self.instances.max_instances == 0 {
            return Err(Error::Validation(
                "instances.max_instances must be at least 1".to_string(),
            ));
        }

        self.ports.validate(self.instances.max_instances)?;

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Validation(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(Error::Validation(
                "circuit_breaker.success_threshold must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Validation(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.retry.factor < 1.0 {
            return Err(Error::Validation(format!(
                "retry.factor must be >= 1.0, got {}",
                self.retry.factor
            )));
        }

        if self.rate_limit.max_requests == 0 {
            return Err(Error::Validation(
                "rate_limit.max_requests must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(Error::Validation(
                "rate_limit.window must be greater than zero".to_string(),
            ));
        }

        if self.shield.monitor_interval.is_zero() || self.shield.heartbeat_interval.is_zero() {
            return Err(Error::Validation(
                "shield intervals must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_healthy_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_ttl() -> Duration {
    Duration::from_secs(90)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(30)
}

/// Registry timing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Period of each instance's background health check.
    #[serde(default = "default_health_check_interval", with = "crate::config::duration_str")]
    pub health_check_interval: Duration,

    #[serde(default = "default_health_check_timeout", with = "crate::config::duration_str")]
    pub health_check_timeout: Duration,

    /// Instances checked this recently are still selectable when not yet
    /// marked healthy.
    #[serde(default = "default_healthy_grace", with = "crate::config::duration_str")]
    pub healthy_grace: Duration,

    /// Instances whose last check is older than this are removed.
    #[serde(default = "default_ttl", with = "crate::config::duration_str")]
    pub ttl: Duration,

    #[serde(default = "default_cleanup_interval", with = "crate::config::duration_str")]
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval(),
            health_check_timeout: default_health_check_timeout(),
            healthy_grace: default_healthy_grace(),
            ttl: default_ttl(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Not probed yet.
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// How [`ServiceRegistry::get_service`](super::ServiceRegistry::get_service)
/// picks among candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    Random,
    FirstAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetServiceOptions {
    /// Only healthy instances (or ones inside the grace window).
    pub healthy_only: bool,
    pub strategy: SelectionStrategy,
}

impl Default for GetServiceOptions {
    fn default() -> Self {
        Self {
            healthy_only: true,
            strategy: SelectionStrategy::RoundRobin,
        }
    }
}

impl GetServiceOptions {
    pub fn with_strategy(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn any_health(mut self) -> Self {
        self.healthy_only = false;
        self
    }
}

/// What a service supplies when registering itself.
///
/// # Examples
///
/// ```
/// use hostmesh::registry::ServiceRegistration;
///
/// let reg = ServiceRegistration::new("stt", 6020)
///     .version("2.1.0")
///     .tag("audio")
///     .metadata("model", "whisper-small");
/// assert_eq!(reg.instance_id(), "stt-127.0.0.1-6020");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    /// Path appended to the base URL for probes; `None` disables probing
    /// and the instance is considered healthy once registered.
    pub health_endpoint: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceRegistration {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            id: None,
            name: name.into(),
            version: "1.0.0".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            protocol: "http".to_string(),
            health_endpoint: Some("/health".to_string()),
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn health_endpoint(mut self, path: Option<&str>) -> Self {
        self.health_endpoint = path.map(str::to_string);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Explicit id, or `<name>-<host>-<port>`.
    pub fn instance_id(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}-{}-{}", self.name, self.host, self.port))
    }
}

/// A registered, health-tracked service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub health_endpoint: Option<String>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub is_healthy: bool,
    pub health_status: HealthStatus,
    pub last_health_check: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub(crate) fn from_registration(reg: ServiceRegistration, now: DateTime<Utc>) -> Self {
        let id = reg.instance_id();
        let is_healthy = reg.health_endpoint.is_none();
        Self {
            id,
            name: reg.name,
            version: reg.version,
            host: reg.host,
            port: reg.port,
            protocol: reg.protocol,
            health_endpoint: reg.health_endpoint,
            tags: reg.tags,
            metadata: reg.metadata,
            is_healthy,
            health_status: if is_healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unknown
            },
            last_health_check: now,
            registered_at: now,
        }
    }

    /// `<protocol>://<host>:<port>`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn health_url(&self) -> Option<String> {
        self.health_endpoint
            .as_ref()
            .map(|path| format!("{}{}", self.base_url(), path))
    }

    /// Time since the last health check (zero if the clock went backwards).
    pub fn since_last_check(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_health_check).to_std().unwrap_or(Duration::ZERO)
    }
}

//! In-process service registry with background health checks.
//!
//! Services register an address and a health endpoint; the registry probes
//! each instance immediately and then every `health_check_interval`, and
//! hands out instances to callers according to a [`SelectionStrategy`].
//!
//! Health checks for one instance never overlap: each instance has its own
//! async mutex, and a check that finds another one in flight waits for it
//! and reports its result instead of probing again.

mod types;

pub use types::{
    GetServiceOptions, HealthStatus, RegistryConfig, SelectionStrategy, ServiceInstance,
    ServiceRegistration,
};

use crate::error::{Error, Result};
use crate::healthcheck::{validate_url, HealthProbe};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn instance_key(name: &str, id: &str) -> String {
    format!("{}/{}", name, id)
}

struct RegistryInner {
    config: RegistryConfig,
    probe: Arc<dyn HealthProbe>,
    services: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    cursors: Mutex<HashMap<String, usize>>,
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    tasks: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

/// Cheaply cloneable handle to one registry.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                probe,
                services: RwLock::new(HashMap::new()),
                cursors: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Register (or replace) an instance and start its health checks.
    ///
    /// Returns the instance id. Must be called from within a tokio runtime.
    pub fn register(&self, registration: ServiceRegistration) -> Result<String> {
        if registration.name.is_empty() {
            return Err(Error::Validation("service name must not be empty".to_string()));
        }

        let instance = ServiceInstance::from_registration(registration, Utc::now());
        if let Some(url) = instance.health_url() {
            validate_url(&url)?;
        }

        let name = instance.name.clone();
        let id = instance.id.clone();
        {
            let mut services = self.inner.services.write();
            let list = services.entry(name.clone()).or_default();
            match list.iter_mut().find(|i| i.id == id) {
                Some(existing) => *existing = instance,
                None => list.push(instance),
            }
        }

        tracing::info!(service = %name, instance_id = %id, "Registered service instance");
        self.spawn_health_task(&name, &id);
        Ok(id)
    }

    /// Remove an instance and stop its health checks.
    pub fn unregister(&self, name: &str, id: &str) -> bool {
        let removed = {
            let mut services = self.inner.services.write();
            let Some(list) = services.get_mut(name) else {
                return false;
            };
            let before = list.len();
            list.retain(|i| i.id != id);
            let removed = list.len() != before;
            if list.is_empty() {
                services.remove(name);
            }
            removed
        };

        if removed {
            self.stop_tracking(name, id);
            tracing::info!(service = %name, instance_id = %id, "Unregistered service instance");
        }
        removed
    }

    fn stop_tracking(&self, name: &str, id: &str) {
        let key = instance_key(name, id);
        if let Some(token) = self.inner.tasks.lock().remove(&key) {
            token.cancel();
        }
        self.inner.gates.lock().remove(&key);
    }

    /// Pick one instance of `name`.
    ///
    /// With `healthy_only`, candidates are instances marked healthy or
    /// checked within the last `healthy_grace` (covers the window between
    /// registration and the first completed probe).
    pub fn get_service(&self, name: &str, options: GetServiceOptions) -> Option<ServiceInstance> {
        let now = Utc::now();
        let grace = self.inner.config.healthy_grace;

        let candidates: Vec<ServiceInstance> = {
            let services = self.inner.services.read();
            services
                .get(name)?
                .iter()
                .filter(|i| !options.healthy_only || i.is_healthy || i.since_last_check(now) <= grace)
                .cloned()
                .collect()
        };

        if candidates.is_empty() {
            tracing::debug!(service = %name, "No candidate instances");
            return None;
        }

        let index = match options.strategy {
            SelectionStrategy::FirstAvailable => 0,
            SelectionStrategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
            SelectionStrategy::RoundRobin => {
                let mut cursors = self.inner.cursors.lock();
                let cursor = cursors.entry(name.to_string()).or_insert(0);
                let index = *cursor % candidates.len();
                *cursor = cursor.wrapping_add(1);
                index
            }
        };
        candidates.into_iter().nth(index)
    }

    /// Every registered instance of `name`, healthy or not.
    pub fn get_instances(&self, name: &str) -> Vec<ServiceInstance> {
        self.inner
            .services
            .read()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn list_services(&self) -> BTreeMap<String, Vec<ServiceInstance>> {
        self.inner
            .services
            .read()
            .iter()
            .map(|(name, list)| (name.clone(), list.clone()))
            .collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Probe one instance and record the result. Never errors; unknown
    /// instances report `false`.
    pub async fn check_instance_health(&self, name: &str, id: &str) -> bool {
        let key = instance_key(name, id);
        let Some(health_url) = self.find(name, id).map(|i| i.health_url()) else {
            return false;
        };

        let gate = Arc::clone(self.inner.gates.lock().entry(key).or_default());
        let _guard = match gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // Another check is in flight: wait for it and report its result
                let _done = gate.lock().await;
                return self.find(name, id).map(|i| i.is_healthy).unwrap_or(false);
            }
        };

        let healthy = match &health_url {
            Some(url) => {
                self.inner
                    .probe
                    .probe(url, self.inner.config.health_check_timeout)
                    .await
            }
            None => true,
        };
        self.record_health(name, id, healthy);
        healthy
    }

    fn find(&self, name: &str, id: &str) -> Option<ServiceInstance> {
        self.inner
            .services
            .read()
            .get(name)?
            .iter()
            .find(|i| i.id == id)
            .cloned()
    }

    fn record_health(&self, name: &str, id: &str, healthy: bool) {
        let mut services = self.inner.services.write();
        let Some(instance) = services
            .get_mut(name)
            .and_then(|list| list.iter_mut().find(|i| i.id == id))
        else {
            return;
        };

        let previous = instance.health_status;
        instance.is_healthy = healthy;
        instance.health_status = if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        instance.last_health_check = Utc::now();

        if previous != instance.health_status {
            if healthy {
                tracing::info!(service = %name, instance_id = %id, "Service instance is healthy");
            } else {
                tracing::warn!(
                    service = %name,
                    instance_id = %id,
                    was = %previous,
                    "Service instance failed health check"
                );
            }
        }
    }

    /// Check every instance concurrently. Returns `(name, id, healthy)`.
    pub async fn check_all(&self) -> Vec<(String, String, bool)> {
        let targets: Vec<(String, String)> = self
            .inner
            .services
            .read()
            .iter()
            .flat_map(|(name, list)| list.iter().map(move |i| (name.clone(), i.id.clone())))
            .collect();

        join_all(targets.into_iter().map(|(name, id)| async move {
            let healthy = self.check_instance_health(&name, &id).await;
            (name, id, healthy)
        }))
        .await
    }

    /// Remove instances whose last health check is older than `ttl`.
    pub fn cleanup_expired_services(&self) -> usize {
        let now = Utc::now();
        let ttl = self.inner.config.ttl;
        let mut expired = Vec::new();

        {
            let mut services = self.inner.services.write();
            for (name, list) in services.iter_mut() {
                list.retain(|i| {
                    let stale = i.since_last_check(now) > ttl;
                    if stale {
                        expired.push((name.clone(), i.id.clone()));
                    }
                    !stale
                });
            }
            services.retain(|_, list| !list.is_empty());
        }

        for (name, id) in &expired {
            tracing::warn!(service = %name, instance_id = %id, "Removed expired service instance");
            self.stop_tracking(name, id);
        }
        expired.len()
    }

    /// Run [`cleanup_expired_services`](Self::cleanup_expired_services)
    /// every `cleanup_interval` until shutdown.
    pub fn start_cleanup(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.child_token();
        let period = self.inner.config.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let Some(registry) = upgrade(&weak) else {
                    return;
                };
                registry.cleanup_expired_services();
            }
        })
    }

    /// Wait until `get_service(name)` yields an instance.
    pub async fn wait_for_service(&self, name: &str, timeout: Duration) -> Result<ServiceInstance> {
        let poll = async {
            loop {
                if let Some(instance) = self.get_service(name, GetServiceOptions::default()) {
                    return instance;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| Error::Timeout {
            operation: format!("waiting for service '{}'", name),
            after: timeout,
        })
    }

    /// Stop every background task. Registered instances stay queryable.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.lock().clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn spawn_health_task(&self, name: &str, id: &str) {
        let token = self.inner.shutdown.child_token();
        if let Some(previous) = self
            .inner
            .tasks
            .lock()
            .insert(instance_key(name, id), token.clone())
        {
            previous.cancel();
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.health_check_interval;
        let name = name.to_string();
        let id = id.to_string();
        tokio::spawn(async move {
            // First tick fires immediately
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let Some(registry) = upgrade(&weak) else {
                    return;
                };
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = registry.check_instance_health(&name, &id) => {}
                }
            }
        });
    }
}

fn upgrade(weak: &Weak<RegistryInner>) -> Option<ServiceRegistry> {
    weak.upgrade().map(|inner| ServiceRegistry { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::StaticProbe;

    fn quiet_config() -> RegistryConfig {
        RegistryConfig {
            health_check_interval: Duration::from_secs(3600),
            ..RegistryConfig::default()
        }
    }

    #[tokio::test]
    async fn register_defaults_id_and_replaces_on_reregister() {
        let registry = ServiceRegistry::new(quiet_config(), Arc::new(StaticProbe::new(true)));
        let id = registry.register(ServiceRegistration::new("stt", 6020)).unwrap();
        assert_eq!(id, "stt-127.0.0.1-6020");

        registry
            .register(ServiceRegistration::new("stt", 6020).version("2.0.0"))
            .unwrap();
        let instances = registry.get_instances("stt");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].version, "2.0.0");
        registry.shutdown();
    }

    #[tokio::test]
    async fn new_instance_is_selectable_inside_grace_window() {
        let probe = Arc::new(StaticProbe::new(false).with_delay(Duration::from_secs(60)));
        let registry = ServiceRegistry::new(quiet_config(), probe);
        registry.register(ServiceRegistration::new("llm", 6040)).unwrap();

        let instance = registry.get_service("llm", GetServiceOptions::default()).unwrap();
        assert_eq!(instance.health_status, HealthStatus::Unknown);
        registry.shutdown();
    }

    #[tokio::test]
    async fn unhealthy_instances_are_skipped_after_grace() {
        let config = RegistryConfig {
            healthy_grace: Duration::ZERO,
            ..quiet_config()
        };
        let probe = Arc::new(StaticProbe::new(true));
        probe.set("http://127.0.0.1:6041/health", false);
        let registry = ServiceRegistry::new(config, probe);
        registry.register(ServiceRegistration::new("llm", 6040)).unwrap();
        registry.register(ServiceRegistration::new("llm", 6041)).unwrap();
        registry.check_all().await;

        for _ in 0..4 {
            let picked = registry
                .get_service("llm", GetServiceOptions::default())
                .unwrap();
            assert_eq!(picked.port, 6040);
        }
        let any = registry
            .get_service("llm", GetServiceOptions::default().any_health())
            .is_some();
        assert!(any);
        registry.shutdown();
    }

    #[tokio::test]
    async fn round_robin_visits_each_instance_once() {
        let registry = ServiceRegistry::new(quiet_config(), Arc::new(StaticProbe::new(true)));
        for port in [6010, 6011, 6012] {
            registry.register(ServiceRegistration::new("ws", port)).unwrap();
        }
        registry.check_all().await;

        for _ in 0..3 {
            let mut ports: Vec<u16> = (0..3)
                .map(|_| {
                    registry
                        .get_service("ws", GetServiceOptions::with_strategy(SelectionStrategy::RoundRobin))
                        .unwrap()
                        .port
                })
                .collect();
            ports.sort_unstable();
            assert_eq!(ports, vec![6010, 6011, 6012]);
        }
        registry.shutdown();
    }

    #[tokio::test]
    async fn first_available_and_unknown_service() {
        let registry = ServiceRegistry::new(quiet_config(), Arc::new(StaticProbe::new(true)));
        registry.register(ServiceRegistration::new("tts", 6030)).unwrap();
        registry.register(ServiceRegistration::new("tts", 6031)).unwrap();
        let options = GetServiceOptions::with_strategy(SelectionStrategy::FirstAvailable);
        assert_eq!(registry.get_service("tts", options).unwrap().port, 6030);
        assert_eq!(registry.get_service("tts", options).unwrap().port, 6030);
        assert!(registry.get_service("missing", options).is_none());
        registry.shutdown();
    }

    #[tokio::test]
    async fn overlapping_checks_share_one_probe() {
        let probe = Arc::new(StaticProbe::new(true).with_delay(Duration::from_millis(100)));
        let registry = ServiceRegistry::new(quiet_config(), Arc::clone(&probe) as Arc<dyn HealthProbe>);
        let id = registry
            .register(ServiceRegistration::new("stt", 6020))
            .unwrap();

        // Let the immediate background check finish
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(probe.calls(), 1);

        let (a, b) = tokio::join!(
            registry.check_instance_health("stt", &id),
            registry.check_instance_health("stt", &id)
        );
        assert!(a && b);
        assert_eq!(probe.calls(), 2);
        registry.shutdown();
    }

    #[tokio::test]
    async fn unregister_stops_tracking() {
        let registry = ServiceRegistry::new(quiet_config(), Arc::new(StaticProbe::new(true)));
        let id = registry.register(ServiceRegistration::new("stt", 6020)).unwrap();
        assert!(registry.unregister("stt", &id));
        assert!(!registry.unregister("stt", &id));
        assert!(registry.service_names().is_empty());
        assert!(!registry.check_instance_health("stt", &id).await);
    }

    #[tokio::test]
    async fn expired_instances_are_cleaned_up() {
        let config = RegistryConfig {
            ttl: Duration::from_millis(50),
            ..quiet_config()
        };
        let registry = ServiceRegistry::new(config, Arc::new(StaticProbe::new(true)));
        registry.register(ServiceRegistration::new("stt", 6020)).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(registry.cleanup_expired_services(), 1);
        assert!(registry.list_services().is_empty());
        registry.shutdown();
    }

    #[tokio::test]
    async fn wait_for_service_times_out() {
        let registry = ServiceRegistry::new(quiet_config(), Arc::new(StaticProbe::new(true)));
        let err = registry
            .wait_for_service("ghost", Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn rejects_bad_registrations() {
        let registry = ServiceRegistry::new(quiet_config(), Arc::new(StaticProbe::new(true)));
        assert!(registry.register(ServiceRegistration::new("", 6000)).is_err());
        assert!(registry
            .register(ServiceRegistration::new("x", 6000).protocol("ftp"))
            .is_err());
    }
}

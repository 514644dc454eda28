//! Composition root tying every component to one process lifetime.
//!
//! Startup order: validate config, claim an instance number, derive pools,
//! reap stale port locks, start the instance heartbeat. Ports are claimed
//! on demand with [`Coordinator::acquire_port`], which must happen before
//! any listening socket is opened. [`Coordinator::shutdown`] undoes all of
//! it; dropping the coordinator without shutting down performs the same
//! cleanup synchronously on a best-effort basis.

mod builder;

pub use builder::CoordinatorBuilder;

use crate::aggregator::HealthAggregator;
use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::instance::{InstanceManager, PortPools};
use crate::lockfile::{run_blocking, LockDirs, LockOwner};
use crate::mesh::ServiceMeshClient;
use crate::port::{LockLostHandler, PortExclusiveLock, PortPoolManager, PortShield, ShieldHandle};
use crate::registry::{ServiceRegistration, ServiceRegistry};
use crate::resilience::{CircuitBreakerManager, RateLimiter};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct HeldPort {
    manager: PortPoolManager,
    shield: ShieldHandle,
}

pub struct Coordinator {
    config: MeshConfig,
    dirs: LockDirs,
    instance: Arc<InstanceManager>,
    instance_number: u32,
    pools: PortPools,
    lock: Arc<PortExclusiveLock>,
    shield: PortShield,
    on_lock_lost: Option<LockLostHandler>,
    held: Mutex<BTreeMap<String, HeldPort>>,
    registry: ServiceRegistry,
    breakers: Arc<CircuitBreakerManager>,
    mesh: Arc<ServiceMeshClient>,
    rate_limiter: Arc<RateLimiter>,
    aggregator: Arc<HealthAggregator>,
    background: CancellationToken,
    shut_down: AtomicBool,
}

impl Coordinator {
    /// Create a new builder for constructing a coordinator.
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    /// Claim a port from the named pool and start shielding it.
    ///
    /// Calling again for a pool this coordinator already holds returns the
    /// same port. Exhaustion is fatal for the caller: no port outside the
    /// pool is ever substituted.
    pub async fn acquire_port(&self, pool: &str) -> Result<u16> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Config("coordinator has been shut down".to_string()));
        }
        if let Some(held) = self.held.lock().get(pool) {
            if let Some(port) = held.manager.held_port() {
                return Ok(port);
            }
        }

        let ports = self
            .pools
            .get(pool)
            .ok_or_else(|| Error::UnknownPool(pool.to_string()))?
            .to_vec();

        let manager = PortPoolManager::new(pool, ports, Arc::clone(&self.lock), self.owner())
            .with_bind_host(self.config.ports.bind_host.clone())
            .with_bind_probe_timeout(self.config.ports.bind_probe_timeout);

        let port = match manager.acquire_or_fail().await {
            Ok(port) => port,
            Err(e) => {
                tracing::error!(
                    pool,
                    instance_number = self.instance_number,
                    "{}",
                    e
                );
                return Err(e);
            }
        };

        let shield = self
            .shield
            .protect(port, self.owner(), self.on_lock_lost.clone());
        self.held
            .lock()
            .insert(pool.to_string(), HeldPort { manager, shield });
        Ok(port)
    }

    /// Stop shielding and release the named pool's port.
    pub async fn release_port(&self, pool: &str) -> Result<bool> {
        let Some(held) = self.held.lock().remove(pool) else {
            return Ok(false);
        };
        held.shield.shutdown().await;
        held.manager.release_async().await?;
        tracing::info!(pool, "Released pool port");
        Ok(true)
    }

    /// Register a service instance with the registry.
    pub fn register_service(&self, registration: ServiceRegistration) -> Result<String> {
        self.registry.register(registration)
    }

    pub fn instance_number(&self) -> u32 {
        self.instance_number
    }

    pub fn owner(&self) -> LockOwner {
        self.instance.owner().clone()
    }

    pub fn pools(&self) -> &PortPools {
        &self.pools
    }

    /// Ports currently held, by pool name.
    pub fn held_ports(&self) -> BTreeMap<String, u16> {
        self.held
            .lock()
            .iter()
            .filter_map(|(pool, held)| held.manager.held_port().map(|p| (pool.clone(), p)))
            .collect()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn lock_dirs(&self) -> &LockDirs {
        &self.dirs
    }

    pub fn port_lock(&self) -> &Arc<PortExclusiveLock> {
        &self.lock
    }

    pub fn instance_manager(&self) -> &Arc<InstanceManager> {
        &self.instance
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn mesh(&self) -> &Arc<ServiceMeshClient> {
        &self.mesh
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn aggregator(&self) -> &Arc<HealthAggregator> {
        &self.aggregator
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop every shield and background task, release every port lock and
    /// delete the instance record. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(instance_number = self.instance_number, "Shutting down coordinator");

        let held: Vec<(String, HeldPort)> = std::mem::take(&mut *self.held.lock()).into_iter().collect();
        let mut first_error = None;
        for (pool, port) in held {
            port.shield.shutdown().await;
            if let Err(e) = port.manager.release_async().await {
                tracing::warn!(pool = %pool, "Failed to release port lock: {}", e);
                first_error.get_or_insert(e);
            }
        }

        self.stop_background();
        let instance = Arc::clone(&self.instance);
        if let Err(e) = run_blocking(move || instance.release()).await {
            tracing::warn!("Failed to release instance record: {}", e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop_background(&self) {
        self.aggregator.stop();
        self.registry.shutdown();
        self.background.cancel();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping each ShieldHandle cancels its timers before the lock goes
        for (pool, held) in std::mem::take(&mut *self.held.lock()) {
            drop(held.shield);
            if let Err(e) = held.manager.release() {
                tracing::warn!(pool = %pool, "Failed to release port lock on drop: {}", e);
            }
        }
        self.stop_background();
        if let Err(e) = self.instance.release() {
            tracing::warn!("Failed to release instance record on drop: {}", e);
        }
    }
}

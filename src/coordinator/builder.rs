use super::Coordinator;
use crate::aggregator::HealthAggregator;
use crate::config::MeshConfig;
use crate::error::Result;
use crate::healthcheck::{HealthProbe, HttpProbe};
use crate::instance::{InstanceManager, PortPools};
use crate::lockfile::{run_blocking, LockDirs, LockOwner};
use crate::mesh::ServiceMeshClient;
use crate::port::{LockLostHandler, PortExclusiveLock, PortShield};
use crate::process::{ProcessLiveness, SystemLiveness};
use crate::registry::ServiceRegistry;
use crate::resilience::{CircuitBreakerManager, RateLimiter};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Builder for constructing a [`Coordinator`] with a fluent API.
///
/// Every component is created here and owned by the coordinator; nothing
/// is a process-wide singleton.
///
/// # Example
///
/// ```no_run
/// use hostmesh::{Coordinator, MeshConfig};
///
/// # async fn example() -> Result<(), hostmesh::Error> {
/// let coordinator = Coordinator::builder()
///     .app_name("voice-assistant")
///     .config(MeshConfig::default())
///     .build()
///     .await?;
///
/// // Claim a port before opening any listener on it
/// let port = coordinator.acquire_port("primary").await?;
/// # let _ = port;
/// coordinator.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct CoordinatorBuilder {
    app_name: Option<String>,
    config: Option<MeshConfig>,
    lock_root: Option<PathBuf>,
    liveness: Option<Arc<dyn ProcessLiveness>>,
    probe: Option<Arc<dyn HealthProbe>>,
    on_lock_lost: Option<LockLostHandler>,
    owner: Option<LockOwner>,
    start_background: bool,
}

impl CoordinatorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            start_background: true,
            ..Self::default()
        }
    }

    /// Set the configuration. Defaults to [`MeshConfig::default`].
    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override `config.app_name` (the lock directory prefix).
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Override the directory holding the lock directories.
    pub fn lock_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.lock_root = Some(root.into());
        self
    }

    /// Process liveness backend. Defaults to the OS.
    pub fn liveness(mut self, liveness: Arc<dyn ProcessLiveness>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Health probe for the registry. Defaults to [`HttpProbe`].
    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Called when a shielded port lock is lost. Defaults to logging and
    /// exiting the process.
    pub fn on_lock_lost(mut self, handler: LockLostHandler) -> Self {
        self.on_lock_lost = Some(handler);
        self
    }

    /// Act as a specific PID/instance id instead of the current process.
    ///
    /// Lets one test process simulate several instances.
    pub fn owner(mut self, owner: LockOwner) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Whether to spawn the registry cleanup, rate limiter sweeper and
    /// health aggregator loops. Defaults to true; the instance heartbeat
    /// always runs.
    pub fn start_background(mut self, start: bool) -> Self {
        self.start_background = start;
        self
    }

    /// Claim an instance number and assemble every component.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<Coordinator> {
        let mut config = self.config.unwrap_or_default();
        if let Some(name) = self.app_name {
            config.app_name = name;
        }
        if let Some(root) = self.lock_root {
            config.lock_root = Some(root);
        }
        config.validate()?;

        let dirs = LockDirs::new(config.lock_root(), config.app_name.clone());
        dirs.ensure()?;

        let liveness = self.liveness.unwrap_or_else(SystemLiveness::shared);
        let instance = Arc::new(match self.owner {
            Some(owner) => InstanceManager::with_identity(
                dirs.clone(),
                config.instances.clone(),
                config.ports.clone(),
                Arc::clone(&liveness),
                owner,
            ),
            None => InstanceManager::new(
                dirs.clone(),
                config.instances.clone(),
                config.ports.clone(),
                Arc::clone(&liveness),
            ),
        });

        let claiming = Arc::clone(&instance);
        let instance_number = run_blocking(move || claiming.detect_instance_number()).await?;

        let lock = Arc::new(PortExclusiveLock::new(dirs.clone(), Arc::clone(&liveness)));
        let pools = match prepare_ports(&instance, instance_number, &lock).await {
            Ok(pools) => pools,
            Err(e) => {
                // Give the number back so a failed start does not hold a slot
                let releasing = Arc::clone(&instance);
                if let Err(release_err) = run_blocking(move || releasing.release()).await {
                    tracing::warn!(
                        instance_number,
                        "Failed to release instance record after startup error: {}",
                        release_err
                    );
                }
                return Err(e);
            }
        };

        let background = CancellationToken::new();
        instance.start_heartbeat(background.child_token());

        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(HttpProbe::new()) as Arc<dyn HealthProbe>);
        let registry = ServiceRegistry::new(config.registry.clone(), probe);
        let breakers = Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone()));
        let mesh = Arc::new(ServiceMeshClient::new(
            registry.clone(),
            Arc::clone(&breakers),
            config.retry.clone(),
            config.mesh.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let aggregator = Arc::new(HealthAggregator::new(
            registry.clone(),
            config.aggregator.clone(),
        ));

        if self.start_background {
            registry.start_cleanup();
            rate_limiter.spawn_sweeper(background.child_token());
            aggregator.start();
        }

        tracing::info!(
            app = %config.app_name,
            instance_number,
            pid = instance.pid(),
            instance_id = %instance.instance_id(),
            base_port = pools.base_port,
            "Coordinator ready"
        );

        Ok(Coordinator {
            shield: PortShield::new(Arc::clone(&lock), config.shield.clone()),
            config,
            dirs,
            instance,
            instance_number,
            pools,
            lock,
            on_lock_lost: self.on_lock_lost,
            held: Mutex::new(BTreeMap::new()),
            registry,
            breakers,
            mesh,
            rate_limiter,
            aggregator,
            background,
            shut_down: AtomicBool::new(false),
        })
    }
}

async fn prepare_ports(
    instance: &InstanceManager,
    instance_number: u32,
    lock: &Arc<PortExclusiveLock>,
) -> Result<PortPools> {
    let pools = instance.calculate_port_pools(instance_number)?;

    let cleaning = Arc::clone(lock);
    let reaped = run_blocking(move || cleaning.cleanup_stale_locks()).await?;
    if reaped > 0 {
        tracing::info!(reaped, "Removed stale port locks left by dead processes");
    }
    Ok(pools)
}

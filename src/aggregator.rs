//! Overall health rollup across every registered service.
//!
//! Subscribers hear about the overall status only when it changes, never on
//! every check.

use crate::registry::ServiceRegistry;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn default_interval() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_interval", with = "crate::config::duration_str")]
    pub interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// Every service has at least one healthy instance.
    Healthy,
    /// Some services do.
    Degraded,
    /// None do.
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthSummary {
    pub healthy: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: OverallStatus,
    pub services: BTreeMap<String, ServiceHealthSummary>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    fn from_results(results: Vec<(String, String, bool)>) -> Self {
        let mut services: BTreeMap<String, ServiceHealthSummary> = BTreeMap::new();
        for (name, _id, healthy) in results {
            let summary = services.entry(name).or_insert(ServiceHealthSummary {
                healthy: 0,
                total: 0,
            });
            summary.total += 1;
            if healthy {
                summary.healthy += 1;
            }
        }

        let up = services.values().filter(|s| s.healthy > 0).count();
        let status = if up == services.len() {
            OverallStatus::Healthy
        } else if up > 0 {
            OverallStatus::Degraded
        } else {
            OverallStatus::Unhealthy
        };

        Self {
            status,
            services,
            checked_at: Utc::now(),
        }
    }
}

/// Emitted when the overall status changes.
#[derive(Debug, Clone)]
pub struct HealthTransition {
    /// `None` before the first completed check.
    pub from: Option<OverallStatus>,
    pub to: OverallStatus,
    pub report: HealthReport,
}

pub struct HealthAggregator {
    registry: ServiceRegistry,
    config: AggregatorConfig,
    events: broadcast::Sender<HealthTransition>,
    last: RwLock<Option<HealthReport>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthAggregator {
    pub fn new(registry: ServiceRegistry, config: AggregatorConfig) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            registry,
            config,
            events,
            last: RwLock::new(None),
            task: Mutex::new(None),
        }
    }

    /// Probe every instance now and publish a transition if the overall
    /// status changed.
    pub async fn check_now(&self) -> HealthReport {
        let report = HealthReport::from_results(self.registry.check_all().await);

        let previous = self
            .last
            .write()
            .replace(report.clone())
            .map(|r| r.status);

        if previous != Some(report.status) {
            tracing::info!(
                from = ?previous,
                to = ?report.status,
                services = report.services.len(),
                "Overall health changed"
            );
            // No subscribers is fine
            let _ = self.events.send(HealthTransition {
                from: previous,
                to: report.status,
                report: report.clone(),
            });
        }
        report
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthTransition> {
        self.events.subscribe()
    }

    /// Status from the last completed check.
    pub fn current_status(&self) -> Option<OverallStatus> {
        self.last.read().as_ref().map(|r| r.status)
    }

    pub fn last_report(&self) -> Option<HealthReport> {
        self.last.read().clone()
    }

    /// Check every `interval` in the background. Calling again restarts the loop.
    pub fn start(self: &Arc<Self>) {
        self.stop();
        let token = CancellationToken::new();
        let aggregator = Arc::downgrade(self);
        let period = self.config.interval;
        let cancel = token.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let Some(aggregator) = aggregator.upgrade() else {
                    return;
                };
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = aggregator.check_now() => {}
                }
            }
        });
        *self.task.lock() = Some((token, handle));
    }

    pub fn stop(&self) {
        if let Some((token, _handle)) = self.task.lock().take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Drop for HealthAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::StaticProbe;
    use crate::registry::{RegistryConfig, ServiceRegistration};

    fn setup(probe: Arc<StaticProbe>) -> (ServiceRegistry, HealthAggregator) {
        let registry = ServiceRegistry::new(
            RegistryConfig {
                health_check_interval: Duration::from_secs(3600),
                ..RegistryConfig::default()
            },
            probe,
        );
        let aggregator = HealthAggregator::new(registry.clone(), AggregatorConfig::default());
        (registry, aggregator)
    }

    #[tokio::test]
    async fn empty_registry_is_healthy() {
        let (_registry, aggregator) = setup(Arc::new(StaticProbe::new(true)));
        let report = aggregator.check_now().await;
        assert_eq!(report.status, OverallStatus::Healthy);
        assert!(report.services.is_empty());
    }

    #[tokio::test]
    async fn rollup_reflects_per_service_health() {
        let probe = Arc::new(StaticProbe::new(true));
        let (registry, aggregator) = setup(Arc::clone(&probe));
        registry.register(ServiceRegistration::new("stt", 6020)).unwrap();
        registry.register(ServiceRegistration::new("tts", 6030)).unwrap();
        assert_eq!(aggregator.check_now().await.status, OverallStatus::Healthy);

        probe.set("http://127.0.0.1:6030/health", false);
        let report = aggregator.check_now().await;
        assert_eq!(report.status, OverallStatus::Degraded);
        assert_eq!(report.services["tts"], ServiceHealthSummary { healthy: 0, total: 1 });

        probe.set("http://127.0.0.1:6020/health", false);
        assert_eq!(aggregator.check_now().await.status, OverallStatus::Unhealthy);
        registry.shutdown();
    }

    #[tokio::test]
    async fn events_fire_only_on_transition() {
        let probe = Arc::new(StaticProbe::new(true));
        let (registry, aggregator) = setup(Arc::clone(&probe));
        registry.register(ServiceRegistration::new("stt", 6020)).unwrap();
        let mut events = aggregator.subscribe();

        aggregator.check_now().await;
        aggregator.check_now().await;
        probe.set("http://127.0.0.1:6020/health", false);
        aggregator.check_now().await;
        aggregator.check_now().await;

        let first = events.try_recv().unwrap();
        assert_eq!(first.from, None);
        assert_eq!(first.to, OverallStatus::Healthy);
        let second = events.try_recv().unwrap();
        assert_eq!(second.from, Some(OverallStatus::Healthy));
        assert_eq!(second.to, OverallStatus::Unhealthy);
        assert!(events.try_recv().is_err());
        registry.shutdown();
    }

    #[tokio::test]
    async fn background_loop_starts_and_stops() {
        let (_registry, aggregator) = setup(Arc::new(StaticProbe::new(true)));
        let aggregator = Arc::new(aggregator);
        aggregator.start();
        assert!(aggregator.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(aggregator.current_status(), Some(OverallStatus::Healthy));

        aggregator.stop();
        assert!(!aggregator.is_running());
    }
}

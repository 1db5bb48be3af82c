// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Service Monitor
//!
//! Background health probing for every service in `running` or `unhealthy`.
//! Probe outcomes drive the `running <-> unhealthy` edges of the state
//! machine; repeated failures on an auto-restart service turn into restart
//! requests sent to the container over a channel, so the monitor never
//! holds a reference back to the container.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::events::CatalogEvent;
use crate::domain::identity::ToolId;
use crate::domain::service::{ServiceConfig, ServiceStatus, ServiceType, Transport};
use crate::infrastructure::container_runtime::ContainerRuntime;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::process::is_pid_alive;
use crate::infrastructure::session::probe_websocket;

/// Failures in a row before a running service is declared unhealthy.
const UNHEALTHY_THRESHOLD: u32 = 3;
const WEBSOCKET_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct ProbeOutcome {
    success: bool,
    response_time_ms: Option<u64>,
    error: Option<String>,
}

/// Aggregate monitoring statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MonitoringStatistics {
    pub probe_interval_seconds: u64,
    pub total_services: usize,
    pub healthy_services: usize,
    pub unhealthy_services: usize,
    pub health_percentage: f64,
    pub average_response_time_ms: f64,
}

/// Periodic health prober and `running <-> unhealthy` transition driver.
pub struct ServiceMonitor {
    services: Arc<RwLock<HashMap<ToolId, ServiceConfig>>>,
    runtime: ContainerRuntime,
    bus: EventBus,
    restart_tx: mpsc::Sender<ToolId>,
    interval: Duration,
    http: reqwest::Client,
}

impl ServiceMonitor {
    pub fn new(
        services: Arc<RwLock<HashMap<ToolId, ServiceConfig>>>,
        runtime: ContainerRuntime,
        bus: EventBus,
        restart_tx: mpsc::Sender<ToolId>,
        interval: Duration,
    ) -> Self {
        Self {
            services,
            runtime,
            bus,
            restart_tx,
            interval,
            http: reqwest::Client::new(),
        }
    }

    /// Spawn the probe loop. Stops when the shutdown token fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.interval, "service monitor started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so freshly started
            // services get a full interval before their first probe.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.probe_all().await,
                }
            }
            info!("service monitor stopped");
        })
    }

    /// One probe round over every service in `running` or `unhealthy`.
    /// Iterates a copied key set so no lock is held across probes.
    pub async fn probe_all(&self) {
        let candidates: Vec<(ToolId, ServiceConfig)> = {
            let services = self.services.read().await;
            services
                .iter()
                .filter(|(_, c)| {
                    matches!(c.status, ServiceStatus::Running | ServiceStatus::Unhealthy)
                })
                .map(|(id, c)| (id.clone(), c.clone()))
                .collect()
        };
        if candidates.is_empty() {
            return;
        }
        debug!(count = candidates.len(), "probing services");

        let probes = candidates.into_iter().map(|(id, config)| async move {
            let outcome = self.probe_service(&config).await;
            (id, outcome)
        });
        let outcomes = futures::future::join_all(probes).await;

        for (id, outcome) in outcomes {
            self.apply_outcome(&id, outcome).await;
        }
    }

    async fn probe_service(&self, config: &ServiceConfig) -> ProbeOutcome {
        // Builtin services fail fast when their recorded process is gone;
        // no point probing a socket nobody owns.
        if config.service_type == ServiceType::Builtin {
            if let Some(pid) = config.process_id {
                if !is_pid_alive(pid) {
                    return ProbeOutcome {
                        success: false,
                        response_time_ms: None,
                        error: Some(format!("process {pid} is not alive")),
                    };
                }
            }
        }

        let started = std::time::Instant::now();
        let result = match config.effective_endpoint() {
            Some(endpoint) => match config.transport {
                Transport::Websocket => probe_websocket(endpoint, WEBSOCKET_PROBE_TIMEOUT)
                    .await
                    .map_err(|e| e.to_string()),
                Transport::Http => self.probe_http(endpoint).await,
            },
            None => match &config.container_id {
                // No endpoint recorded: fall back to container liveness.
                Some(container_id) => match self.runtime.is_running(container_id).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err("container is not running".to_string()),
                    Err(e) => Err(e.to_string()),
                },
                None => Err("service has no endpoint".to_string()),
            },
        };

        let elapsed = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => ProbeOutcome {
                success: true,
                response_time_ms: Some(elapsed),
                error: None,
            },
            Err(error) => ProbeOutcome {
                success: false,
                response_time_ms: None,
                error: Some(error),
            },
        }
    }

    async fn probe_http(&self, endpoint: &str) -> Result<(), String> {
        let url = if endpoint.contains("/health") {
            endpoint.to_string()
        } else {
            format!("{}/health", endpoint.trim_end_matches('/'))
        };
        match self
            .http
            .get(&url)
            .timeout(HTTP_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().as_u16() < 400 => Ok(()),
            Ok(response) => Err(format!("health endpoint returned {}", response.status())),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Fold one probe outcome into the service's health and drive the
    /// status edges it implies.
    async fn apply_outcome(&self, id: &ToolId, outcome: ProbeOutcome) {
        let mut services = self.services.write().await;
        let Some(config) = services.get_mut(id) else {
            return;
        };
        // The container may have transitioned the service while we probed.
        if !matches!(config.status, ServiceStatus::Running | ServiceStatus::Unhealthy) {
            return;
        }

        metrics::counter!(
            "toolhost_probes_total",
            "service" => id.to_string(),
            "outcome" => if outcome.success { "ok" } else { "fail" }
        )
        .increment(1);

        config
            .health
            .record_probe(outcome.success, outcome.response_time_ms, outcome.error.clone());

        if outcome.success {
            if config.status == ServiceStatus::Unhealthy {
                info!(service = %id, "service recovered");
                let from = config.status;
                if config.mark_running().is_ok() {
                    self.bus
                        .publish(CatalogEvent::status_changed(from, config.snapshot()));
                }
            }
            return;
        }

        warn!(
            service = %id,
            failures = config.health.consecutive_failures,
            error = ?outcome.error,
            "probe failed"
        );

        if config.status == ServiceStatus::Running
            && config.health.consecutive_failures >= UNHEALTHY_THRESHOLD
        {
            let from = config.status;
            if config.mark_unhealthy().is_ok() {
                self.bus
                    .publish(CatalogEvent::status_changed(from, config.snapshot()));
            }
        }

        if config.status == ServiceStatus::Unhealthy
            && config.health.consecutive_failures >= UNHEALTHY_THRESHOLD
            && config.policy.auto_restart
        {
            // The container owns the restart budget; we only ask.
            if let Err(e) = self.restart_tx.try_send(id.clone()) {
                debug!(service = %id, error = %e, "restart request not enqueued");
            }
        }
    }

    pub async fn statistics(&self) -> MonitoringStatistics {
        let services = self.services.read().await;
        let total = services.len();
        let healthy = services.values().filter(|c| c.health.is_healthy).count();
        let times: Vec<u64> = services
            .values()
            .filter_map(|c| c.health.recent_response_time_ms)
            .collect();
        let average = if times.is_empty() {
            0.0
        } else {
            times.iter().sum::<u64>() as f64 / times.len() as f64
        };
        MonitoringStatistics {
            probe_interval_seconds: self.interval.as_secs(),
            total_services: total,
            healthy_services: healthy,
            unhealthy_services: total - healthy,
            health_percentage: if total == 0 {
                0.0
            } else {
                healthy as f64 / total as f64 * 100.0
            },
            average_response_time_ms: (average * 100.0).round() / 100.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::{InstallMethod, ServiceHealth, ServiceMetadata, SupervisionPolicy};
    use std::path::PathBuf;

    fn service(endpoint: Option<&str>, status: ServiceStatus) -> ServiceConfig {
        ServiceConfig {
            service_id: ToolId::new("deepsearch"),
            display_name: "DeepSearch".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            service_type: ServiceType::External,
            install_method: InstallMethod::None,
            host: "127.0.0.1".to_string(),
            port: None,
            endpoint: None,
            transport: Transport::Http,
            working_directory: None,
            entry_point: None,
            environment: HashMap::new(),
            source_url: None,
            container_image: None,
            capabilities: vec![],
            policy: SupervisionPolicy::default(),
            metadata: ServiceMetadata::default(),
            status,
            process_id: None,
            container_id: None,
            actual_endpoint: endpoint.map(str::to_string),
            health: ServiceHealth {
                is_healthy: status == ServiceStatus::Running,
                ..ServiceHealth::default()
            },
        }
    }

    fn monitor(
        services: Arc<RwLock<HashMap<ToolId, ServiceConfig>>>,
    ) -> (Arc<ServiceMonitor>, mpsc::Receiver<ToolId>, EventBus) {
        let bus = EventBus::with_default_capacity();
        let (tx, rx) = mpsc::channel(8);
        let monitor = Arc::new(ServiceMonitor::new(
            services,
            ContainerRuntime::new(PathBuf::from("/nonexistent/container-runtime")),
            bus.clone(),
            tx,
            Duration::from_secs(30),
        ));
        (monitor, rx, bus)
    }

    #[tokio::test]
    async fn test_three_failures_transition_to_unhealthy_and_request_restart() {
        let id = ToolId::new("deepsearch");
        // Nothing listens on this endpoint, every probe fails.
        let services = Arc::new(RwLock::new(HashMap::from([(
            id.clone(),
            service(Some("http://127.0.0.1:1"), ServiceStatus::Running),
        )])));
        let (monitor, mut restart_rx, bus) = monitor(services.clone());
        let mut events = bus.subscribe();

        for _ in 0..3 {
            monitor.probe_all().await;
        }

        let config = services.read().await.get(&id).cloned().unwrap();
        assert_eq!(config.status, ServiceStatus::Unhealthy);
        assert_eq!(config.health.consecutive_failures, 3);

        // Status event was broadcast for the edge.
        let mut saw_unhealthy = false;
        while let Ok(event) = events.try_recv() {
            if let CatalogEvent::StatusChanged { to, .. } = event {
                if to == ServiceStatus::Unhealthy {
                    saw_unhealthy = true;
                }
            }
        }
        assert!(saw_unhealthy);

        // A restart was requested for the auto-restart service.
        assert_eq!(restart_rx.try_recv().ok(), Some(id));
    }

    #[tokio::test]
    async fn test_probe_success_recovers_unhealthy_service() {
        let mut server = mockito::Server::new_async().await;
        let _health = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;

        let id = ToolId::new("deepsearch");
        let mut unhealthy = service(Some(&server.url()), ServiceStatus::Unhealthy);
        unhealthy.health.consecutive_failures = 4;
        let services = Arc::new(RwLock::new(HashMap::from([(id.clone(), unhealthy)])));
        let (monitor, _rx, bus) = monitor(services.clone());
        let mut events = bus.subscribe();

        monitor.probe_all().await;

        let config = services.read().await.get(&id).cloned().unwrap();
        assert_eq!(config.status, ServiceStatus::Running);
        assert!(config.health.is_healthy);
        assert_eq!(config.health.consecutive_failures, 0);

        let mut saw_recovery = false;
        while let Ok(event) = events.try_recv() {
            if let CatalogEvent::StatusChanged { to, .. } = event {
                if to == ServiceStatus::Running {
                    saw_recovery = true;
                }
            }
        }
        assert!(saw_recovery);
    }

    #[tokio::test]
    async fn test_stopped_services_are_not_probed() {
        let id = ToolId::new("deepsearch");
        let services = Arc::new(RwLock::new(HashMap::from([(
            id.clone(),
            service(Some("http://127.0.0.1:1"), ServiceStatus::Stopped),
        )])));
        let (monitor, _rx, _bus) = monitor(services.clone());

        monitor.probe_all().await;
        let config = services.read().await.get(&id).cloned().unwrap();
        assert_eq!(config.health.probe_count, 0);
    }

    #[tokio::test]
    async fn test_builtin_with_dead_pid_fails_fast() {
        let id = ToolId::new("deepsearch");
        let mut builtin = service(Some("http://127.0.0.1:1"), ServiceStatus::Running);
        builtin.service_type = ServiceType::Builtin;
        builtin.process_id = Some(4_000_000);
        let services = Arc::new(RwLock::new(HashMap::from([(id.clone(), builtin)])));
        let (monitor, _rx, _bus) = monitor(services.clone());

        monitor.probe_all().await;
        let config = services.read().await.get(&id).cloned().unwrap();
        assert_eq!(config.health.consecutive_failures, 1);
        assert!(config
            .health
            .last_error_message
            .as_deref()
            .unwrap_or_default()
            .contains("not alive"));
    }

    #[tokio::test]
    async fn test_statistics() {
        let id = ToolId::new("deepsearch");
        let mut running = service(Some("http://127.0.0.1:1"), ServiceStatus::Running);
        running.health.is_healthy = true;
        running.health.recent_response_time_ms = Some(12);
        let services = Arc::new(RwLock::new(HashMap::from([(id, running)])));
        let (monitor, _rx, _bus) = monitor(services);

        let stats = monitor.statistics().await;
        assert_eq!(stats.total_services, 1);
        assert_eq!(stats.healthy_services, 1);
        assert_eq!(stats.health_percentage, 100.0);
        assert_eq!(stats.average_response_time_ms, 12.0);
    }
}

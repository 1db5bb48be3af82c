// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Toolhost Composition Root
//!
//! The single long-lived core object constructed at boot. It owns the
//! registry, service container, router and monitor, and wires them together
//! with the event bus and the restart channel. Dependents receive it by
//! reference; there are no process-wide singletons.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::application::container::ServiceContainer;
use crate::application::monitor::ServiceMonitor;
use crate::application::router::{RouterConfig, ToolRouter};
use crate::domain::config::ToolhostConfig;
use crate::domain::identity::{IdentityRegistry, RegistryConfig};
use crate::infrastructure::container_runtime::ContainerRuntime;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::pool::spawn_idle_sweeper;

/// The assembled toolhost core.
pub struct Toolhost {
    pub config: ToolhostConfig,
    pub registry: Arc<IdentityRegistry>,
    pub container: Arc<ServiceContainer>,
    pub router: Arc<ToolRouter>,
    pub monitor: Arc<ServiceMonitor>,
    pub bus: EventBus,
    shutdown: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl Toolhost {
    /// Construct and boot the whole core: registry, catalog, recovery,
    /// auto-start and the background loops.
    pub async fn boot(config: ToolhostConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.storage_root)
            .await
            .with_context(|| format!("creating storage root {}", config.storage_root.display()))?;

        // 1. Identity registry from config file or builtin defaults.
        let registry_config = match &config.registry_config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading registry config {}", path.display()))?;
                serde_json::from_str::<RegistryConfig>(&raw)
                    .with_context(|| format!("parsing registry config {}", path.display()))?
            }
            None => RegistryConfig::builtin_defaults(),
        };
        let registry = Arc::new(
            IdentityRegistry::from_config(&registry_config).context("building identity registry")?,
        );

        let bus = EventBus::with_default_capacity();
        let shutdown = CancellationToken::new();

        // 2. Service container: discovery, persisted services, recovery.
        let container = Arc::new(ServiceContainer::new(
            config.clone(),
            registry.clone(),
            registry_config,
            bus.clone(),
            shutdown.clone(),
        ));
        let autostart = container.initialize().await;

        // 3. Router over the shared catalog.
        let router = Arc::new(ToolRouter::new(
            registry.clone(),
            container.services_handle(),
            RouterConfig::from(&config),
        ));

        let mut background = Vec::new();

        // 4. Wiring: restart channel, catalog listener, idle sweep.
        let (restart_tx, restart_rx) = mpsc::channel(32);
        background.push(container.spawn_restart_worker(restart_rx));
        background.push(router.spawn_catalog_listener(&bus, shutdown.clone()));
        background.push(spawn_idle_sweeper(router.pools_handle(), shutdown.clone()));

        // 5. Auto-start the fleet, then begin monitoring it.
        container.autostart_all(autostart).await;

        let monitor = Arc::new(ServiceMonitor::new(
            container.services_handle(),
            ContainerRuntime::new(config.container_runtime.clone()),
            bus.clone(),
            restart_tx,
            std::time::Duration::from_secs(config.probe_interval_seconds),
        ));
        background.push(monitor.clone().spawn(shutdown.clone()));

        info!("toolhost core booted");
        Ok(Self {
            config,
            registry,
            container,
            router,
            monitor,
            bus,
            shutdown,
            background,
        })
    }

    /// Cooperative shutdown: stop the monitor and background loops, close
    /// all sessions, terminate children within the budget.
    pub async fn shutdown(&self) {
        info!("toolhost shutting down");
        self.shutdown.cancel();
        self.router.close_all_sessions().await;
        self.container.shutdown().await;
        for task in &self.background {
            task.abort();
        }
    }
}

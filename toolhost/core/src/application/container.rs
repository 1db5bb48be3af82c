// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Service Container
//!
//! The lifecycle heart of the toolhost: discovers builtin servers, loads and
//! recovers installed ones, composes the identity registry, port allocator
//! and process supervisor, and drives every service through its state
//! machine. Per-service transitions are serialized behind a per-service
//! lock; one bad service never takes the fleet down.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::config::ToolhostConfig;
use crate::domain::events::CatalogEvent;
use crate::domain::identity::{
    IdentityRegistry, RegistryConfig, ToolDefinition, ToolId,
};
use crate::domain::service::{
    InstallationResult, ServiceConfig, ServiceError, ServiceSnapshot, ServiceStatus, ServiceType,
};
use crate::infrastructure::container_runtime::{ContainerError, ContainerRuntime};
use crate::infrastructure::discovery::BuiltinDiscovery;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::installer::{InstallError, InstallSpec, ServiceInstaller};
use crate::infrastructure::ports::{PortAllocator, PortError};
use crate::infrastructure::process::{
    self, backoff_delay, find_listener, is_pid_alive, ProcessError, ProcessStatus,
    ProcessSupervisor, ReadyOutcome,
};

/// Grace window when removing a stale listener during conflict resolution.
const STALE_TERMINATION_GRACE: Duration = Duration::from_secs(5);
/// Whole-fleet stop budget during shutdown, before forced kills.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("service not found: {0}")]
    UnknownService(ToolId),

    #[error("builtin service '{0}' cannot be uninstalled")]
    BuiltinImmutable(ToolId),

    #[error("service id '{0}' collides with a builtin service")]
    BuiltinCollision(ToolId),

    #[error("startup of '{service}' failed: {reason}")]
    Startup { service: ToolId, reason: String },

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Runtime(#[from] ContainerError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    State(#[from] ServiceError),
}

/// Aggregate catalog statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CatalogStatistics {
    pub total_services: usize,
    pub builtin_services: usize,
    pub external_services: usize,
    pub container_services: usize,
    pub running_services: usize,
    pub healthy_services: usize,
    pub total_capabilities: usize,
    pub status_distribution: BTreeMap<String, usize>,
}

/// The unified service manager composing registry, ports, supervisor and
/// event bus.
pub struct ServiceContainer {
    config: ToolhostConfig,
    registry: Arc<IdentityRegistry>,
    registry_config: parking_lot::Mutex<RegistryConfig>,
    ports: Arc<PortAllocator>,
    supervisor: Arc<ProcessSupervisor>,
    runtime: ContainerRuntime,
    installer: ServiceInstaller,
    discovery: BuiltinDiscovery,
    bus: EventBus,
    services: Arc<RwLock<HashMap<ToolId, ServiceConfig>>>,
    transition_locks: DashMap<ToolId, Arc<Mutex<()>>>,
    restart_counters: DashMap<ToolId, u32>,
    shutdown: CancellationToken,
}

impl ServiceContainer {
    pub fn new(
        config: ToolhostConfig,
        registry: Arc<IdentityRegistry>,
        registry_config: RegistryConfig,
        bus: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        let runtime = ContainerRuntime::new(config.container_runtime.clone());
        let installer = ServiceInstaller::new(config.install_dir(), runtime.clone());
        let discovery = BuiltinDiscovery::new(config.builtin_dir.clone());
        let ports = Arc::new(PortAllocator::new(
            config.port_range_start,
            config.port_range_end,
        ));
        Self {
            registry,
            registry_config: parking_lot::Mutex::new(registry_config),
            ports,
            supervisor: Arc::new(ProcessSupervisor::new(Duration::from_secs(10))),
            runtime,
            installer,
            discovery,
            bus,
            services: Arc::new(RwLock::new(HashMap::new())),
            transition_locks: DashMap::new(),
            restart_counters: DashMap::new(),
            shutdown,
            config,
        }
    }

    /// Shared view of the catalog, consumed by the router and monitor.
    pub fn services_handle(&self) -> Arc<RwLock<HashMap<ToolId, ServiceConfig>>> {
        self.services.clone()
    }

    pub fn supervisor_handle(&self) -> Arc<ProcessSupervisor> {
        self.supervisor.clone()
    }

    pub fn registry_handle(&self) -> Arc<IdentityRegistry> {
        self.registry.clone()
    }

    /// Discover builtins, load persisted externals, build the unified
    /// catalog and recover still-running artifacts. Does not start anything;
    /// [`Self::autostart_all`] is the second boot phase.
    pub async fn initialize(&self) -> Vec<ToolId> {
        let snapshot = self.registry.snapshot();

        // 1. Builtins from the well-known directory. Builtin wins on any
        // later collision with an installed service.
        let builtins = self.discovery.discover(&snapshot);
        self.discovery.write_descriptor_files(&builtins);

        // 2. Persisted external services.
        let externals = self.installer.load_installed();

        let mut catalog: HashMap<ToolId, ServiceConfig> = HashMap::new();
        for (id, config) in builtins {
            catalog.insert(id, config);
        }
        for config in externals {
            if catalog.contains_key(&config.service_id) {
                warn!(service = %config.service_id, "installed service shadows a builtin, builtin wins");
                continue;
            }
            self.extend_registry(&config);
            catalog.insert(config.service_id.clone(), config);
        }

        // 3. Recover runtime artifacts that survived a supervisor restart.
        let mut autostart = Vec::new();
        for config in catalog.values_mut() {
            let recovered = self.recover_service(config).await;
            if !recovered && config.policy.auto_start {
                autostart.push(config.service_id.clone());
            }
        }

        // 4. Publish the initial catalog.
        {
            let mut services = self.services.write().await;
            for (id, config) in catalog {
                self.bus.publish(CatalogEvent::registered(config.snapshot()));
                services.insert(id, config);
            }
        }

        info!(
            services = self.services.read().await.len(),
            autostart = autostart.len(),
            "service container initialized"
        );
        autostart
    }

    /// Whether a persisted runtime artifact is still alive. Adopting it
    /// avoids a pointless relaunch after a supervisor restart.
    async fn recover_service(&self, config: &mut ServiceConfig) -> bool {
        // Builtins record their pid in server.pid inside the working dir.
        if config.process_id.is_none() {
            if let Some(dir) = &config.working_directory {
                if let Ok(raw) = std::fs::read_to_string(dir.join("server.pid")) {
                    config.process_id = raw.trim().parse::<u32>().ok();
                }
            }
        }

        if let Some(pid) = config.process_id {
            if is_pid_alive(pid) && config.port.is_some() {
                info!(service = %config.service_id, pid, "adopting still-running process");
                config.status = ServiceStatus::Running;
                config.actual_endpoint = Some(config.endpoint_for_port(config.port.unwrap_or(0)));
                config.health.is_healthy = true;
                return true;
            }
            config.process_id = None;
        }

        if let Some(container_id) = config.container_id.clone() {
            match self.runtime.is_running(&container_id).await {
                Ok(true) => {
                    info!(service = %config.service_id, container = %container_id, "adopting running container");
                    config.status = ServiceStatus::Running;
                    config.health.is_healthy = true;
                    return true;
                }
                Ok(false) | Err(_) => {
                    config.container_id = None;
                }
            }
        }

        // Exited or never started: back to stopped, relaunch is deferred to
        // autostart or an explicit start.
        config.status = ServiceStatus::Stopped;
        config.health.is_healthy = false;
        false
    }

    /// Start every auto-start service. Failures are logged and the service
    /// parks in `error`; the fleet keeps booting.
    pub async fn autostart_all(self: &Arc<Self>, service_ids: Vec<ToolId>) {
        let mut handles = Vec::new();
        for id in service_ids {
            let container = self.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = container.start_service(&id).await {
                    error!(service = %id, error = %e, "auto-start failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn transition_lock(&self, id: &ToolId) -> Arc<Mutex<()>> {
        self.transition_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_config(&self, id: &ToolId) -> Result<ServiceConfig, LifecycleError> {
        self.services
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownService(id.clone()))
    }

    async fn write_back(&self, config: ServiceConfig) {
        self.services
            .write()
            .await
            .insert(config.service_id.clone(), config);
    }

    async fn persist_if_installed(&self, config: &ServiceConfig) {
        if config.service_type != ServiceType::Builtin {
            if let Err(e) = self.installer.save_config(config).await {
                warn!(service = %config.service_id, error = %e, "failed to persist service config");
            }
        }
    }

    fn publish_status(&self, from: ServiceStatus, config: &ServiceConfig) {
        self.bus
            .publish(CatalogEvent::status_changed(from, config.snapshot()));
    }

    /// Start a service. Idempotent when it is already running or starting.
    pub async fn start_service(&self, id: &ToolId) -> Result<(), LifecycleError> {
        let lock = self.transition_lock(id);
        let _guard = lock.lock().await;

        let mut config = self.read_config(id).await?;
        match config.status {
            ServiceStatus::Running | ServiceStatus::Starting => {
                debug!(service = %id, "already running, start is a no-op");
                return Ok(());
            }
            ServiceStatus::Unhealthy => {
                debug!(service = %id, "unhealthy service start treated as restart");
            }
            _ => {}
        }
        if config.status == ServiceStatus::Unhealthy || config.status == ServiceStatus::Stopping {
            // Unwind to stopped first so the transition below is legal.
            self.stop_locked(&mut config).await?;
        }

        let from = config.begin_start()?;
        self.write_back(config.clone()).await;
        self.publish_status(from, &config);
        info!(service = %id, "starting service");

        match self.launch_and_wait(&mut config).await {
            Ok(()) => {
                let from = config.status;
                config.mark_running()?;
                config.health.record_probe(true, None, None);
                self.restart_counters.insert(id.clone(), 0);
                self.write_back(config.clone()).await;
                self.persist_if_installed(&config).await;
                self.publish_status(from, &config);
                info!(service = %id, endpoint = ?config.actual_endpoint, "service running");
                Ok(())
            }
            Err(e) => {
                let from = config.mark_error(e.to_string());
                if let Some(port) = config.port {
                    self.ports.release(port);
                }
                self.write_back(config.clone()).await;
                self.persist_if_installed(&config).await;
                self.publish_status(from, &config);
                Err(e)
            }
        }
    }

    /// Allocate a port, resolve conflicts, spawn the runtime artifact and
    /// wait for readiness. On success `config` carries the new pid or
    /// container id, the leased port and the actual endpoint.
    async fn launch_and_wait(&self, config: &mut ServiceConfig) -> Result<(), LifecycleError> {
        let id = config.service_id.clone();
        let port = self.ports.allocate()?;
        // Defuse on success; any early return releases the lease.
        let port_guard = scopeguard::guard(port, |p| self.ports.release(p));

        // The allocator verified the port free, but a stale instance may
        // grab it in the window before our spawn.
        if !self.ports.is_free(port) {
            self.resolve_port_conflict(config, port).await?;
        }

        match config.service_type {
            ServiceType::Builtin | ServiceType::External => {
                let workdir = config.working_directory.clone().ok_or_else(|| {
                    LifecycleError::Startup {
                        service: id.clone(),
                        reason: "no working directory".to_string(),
                    }
                })?;
                let argv =
                    ProcessSupervisor::entry_command(&workdir, config.entry_point.as_deref())?;
                let pid = self
                    .supervisor
                    .launch_with_command(&id, &argv, &workdir, &config.environment, port)
                    .await?;
                config.process_id = Some(pid);
            }
            ServiceType::Container => {
                let image = config.container_image.clone().ok_or_else(|| {
                    LifecycleError::Startup {
                        service: id.clone(),
                        reason: "no container image".to_string(),
                    }
                })?;
                if !self.runtime.image_exists(&image).await.unwrap_or(false) {
                    self.runtime.pull(&image).await?;
                }
                let internal_port = config.port.unwrap_or(8080);
                let container_id = self
                    .runtime
                    .run_detached(&id, &image, port, internal_port)
                    .await?;
                config.container_id = Some(container_id);
            }
        }

        config.port = Some(port);
        config.actual_endpoint = Some(config.endpoint_for_port(port));

        let deadline = Duration::from_secs(config.policy.startup_timeout_seconds);
        match self
            .supervisor
            .wait_ready(&id, port, config.transport, deadline)
            .await
        {
            ReadyOutcome::Ready => {
                scopeguard::ScopeGuard::into_inner(port_guard);
                Ok(())
            }
            ReadyOutcome::Crashed(code) => {
                let _ = self.supervisor.terminate(&id).await;
                config.process_id = None;
                Err(LifecycleError::Startup {
                    service: id,
                    reason: format!("process exited during startup (code {code:?})"),
                })
            }
            ReadyOutcome::TimedOut => {
                self.teardown_runtime_artifact(config).await;
                Err(LifecycleError::Startup {
                    service: id,
                    reason: format!("not ready within {}s", deadline.as_secs()),
                })
            }
        }
    }

    /// Port conflict handling: when the freshly allocated port is already
    /// held, an earlier instance of the same service is terminated and the
    /// launch retried once; any other listener fails the launch.
    async fn resolve_port_conflict(
        &self,
        config: &ServiceConfig,
        port: u16,
    ) -> Result<(), LifecycleError> {
        let Some((pid, cmdline)) = find_listener(port) else {
            // Listener vanished on its own.
            return Ok(());
        };

        if !Self::is_same_service(&cmdline, config) {
            return Err(LifecycleError::Startup {
                service: config.service_id.clone(),
                reason: format!(
                    "port {port} is held by an unrelated process (pid {pid}, '{cmdline}')"
                ),
            });
        }

        warn!(
            service = %config.service_id,
            pid,
            port,
            "terminating stale instance holding our port"
        );
        process::terminate_stale_pid(pid, STALE_TERMINATION_GRACE).await;

        // One retry: wait briefly for the kernel to release the socket.
        for _ in 0..10 {
            if self.ports.is_free(port) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Err(LifecycleError::Startup {
            service: config.service_id.clone(),
            reason: format!("port {port} was not released after terminating pid {pid}"),
        })
    }

    /// Whether a listener command line identifies an earlier instance of
    /// this service.
    fn is_same_service(cmdline: &str, config: &ServiceConfig) -> bool {
        if cmdline.contains(config.service_id.as_str()) {
            return true;
        }
        match (&config.working_directory, &config.entry_point) {
            (Some(dir), Some(entry)) => {
                cmdline.contains(&dir.join(entry).to_string_lossy().to_string())
                    || (cmdline.contains(entry) && cmdline.contains(&dir.to_string_lossy().to_string()))
            }
            (_, Some(entry)) => cmdline.contains(entry),
            _ => false,
        }
    }

    async fn teardown_runtime_artifact(&self, config: &mut ServiceConfig) {
        match config.service_type {
            ServiceType::Builtin | ServiceType::External => {
                match self.supervisor.terminate(&config.service_id).await {
                    Ok(()) => {}
                    Err(ProcessError::NotSupervised(_)) => {
                        // Adopted from a previous run: no child handle.
                        if let Some(pid) = config.process_id {
                            process::terminate_stale_pid(pid, STALE_TERMINATION_GRACE).await;
                        }
                    }
                    Err(e) => warn!(service = %config.service_id, error = %e, "termination failed"),
                }
                config.process_id = None;
            }
            ServiceType::Container => {
                if let Some(container_id) = config.container_id.take() {
                    if let Err(e) = self.runtime.stop(&container_id).await {
                        warn!(service = %config.service_id, error = %e, "container stop failed");
                    }
                }
            }
        }
    }

    /// Stop a service. Idempotent when it is already stopped.
    pub async fn stop_service(&self, id: &ToolId) -> Result<(), LifecycleError> {
        let lock = self.transition_lock(id);
        let _guard = lock.lock().await;

        let mut config = self.read_config(id).await?;
        if config.status == ServiceStatus::Stopped {
            debug!(service = %id, "already stopped, stop is a no-op");
            return Ok(());
        }
        self.stop_locked(&mut config).await?;
        self.write_back(config.clone()).await;
        self.persist_if_installed(&config).await;
        Ok(())
    }

    /// Stop body shared by stop/restart paths. Caller holds the lock.
    async fn stop_locked(&self, config: &mut ServiceConfig) -> Result<(), LifecycleError> {
        let from = config.begin_stop()?;
        self.publish_status(from, config);
        info!(service = %config.service_id, "stopping service");

        self.teardown_runtime_artifact(config).await;

        let port = config.port;
        let from = config.status;
        config.mark_stopped()?;
        if let Some(port) = port {
            self.ports.release(port);
        }
        self.publish_status(from, config);
        Ok(())
    }

    /// Manual restart: resets the restart budget, then stop + start.
    pub async fn restart_service(&self, id: &ToolId) -> Result<(), LifecycleError> {
        info!(service = %id, "manual restart requested");
        self.restart_counters.insert(id.clone(), 0);
        self.stop_service(id).await?;
        self.start_service(id).await
    }

    /// Budgeted automatic restart, invoked by the monitor through the
    /// restart channel. Applies exponential backoff per attempt and parks
    /// the service in `error` once the budget is spent.
    pub async fn auto_restart_service(&self, id: &ToolId) {
        let config = match self.read_config(id).await {
            Ok(config) => config,
            Err(_) => return,
        };
        if !config.policy.auto_restart {
            return;
        }

        let attempt = {
            let mut counter = self.restart_counters.entry(id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        if attempt > config.policy.max_restarts {
            warn!(service = %id, attempt, "restart budget exhausted");
            let lock = self.transition_lock(id);
            let _guard = lock.lock().await;
            if let Ok(mut config) = self.read_config(id).await {
                self.teardown_runtime_artifact(&mut config).await;
                if let Some(port) = config.port {
                    self.ports.release(port);
                }
                let from = config.mark_error("restart budget exhausted");
                self.write_back(config.clone()).await;
                self.publish_status(from, &config);
            }
            return;
        }

        let delay = backoff_delay(config.policy.restart_backoff_seconds, attempt - 1);
        info!(service = %id, attempt, ?delay, "auto-restart scheduled");
        tokio::select! {
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        if let Err(e) = self.stop_service(id).await {
            warn!(service = %id, error = %e, "auto-restart stop failed");
        }
        if let Err(e) = self.start_service(id).await {
            error!(service = %id, error = %e, "auto-restart start failed");
        }
    }

    /// Consume restart requests from the monitor. Message passing keeps the
    /// monitor free of a back-reference to the container.
    pub fn spawn_restart_worker(
        self: &Arc<Self>,
        mut requests: mpsc::Receiver<ToolId>,
    ) -> tokio::task::JoinHandle<()> {
        let container = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = container.shutdown.cancelled() => break,
                    request = requests.recv() => {
                        match request {
                            Some(id) => container.auto_restart_service(&id).await,
                            None => break,
                        }
                    }
                }
            }
        })
    }

    /// Install an external service and register it in the catalog.
    pub async fn install_service(
        &self,
        spec: &InstallSpec,
    ) -> Result<InstallationResult, LifecycleError> {
        let config = match self.installer.install(spec).await {
            Ok(config) => config,
            Err(e) => {
                return Err(LifecycleError::Install(e));
            }
        };
        let id = config.service_id.clone();

        {
            let services = self.services.read().await;
            if let Some(existing) = services.get(&id) {
                if existing.service_type == ServiceType::Builtin {
                    return Err(LifecycleError::BuiltinCollision(id));
                }
            }
        }

        self.extend_registry(&config);

        let result = InstallationResult {
            success: true,
            service_id: id.clone(),
            endpoint: config.effective_endpoint().map(str::to_string),
            container_id: config.container_id.clone(),
            port: config.port,
            install_path: Some(self.installer.install_dir(&id)),
            error: None,
        };
        if let Err(e) = self.installer.save_result(&id, &result).await {
            warn!(service = %id, error = %e, "failed to persist installation result");
        }

        let fresh = {
            let mut services = self.services.write().await;
            let fresh = !services.contains_key(&id);
            services.entry(id.clone()).or_insert(config.clone());
            fresh
        };
        if fresh {
            self.bus.publish(CatalogEvent::registered(config.snapshot()));
        }

        if config.policy.auto_start {
            if let Err(e) = self.start_service(&id).await {
                warn!(service = %id, error = %e, "installed service failed to start");
            }
        }
        Ok(result)
    }

    /// Uninstall an external service: stop, remove files, drop from the
    /// catalog. Builtins are never destroyed.
    pub async fn uninstall_service(&self, id: &ToolId) -> Result<(), LifecycleError> {
        let config = self.read_config(id).await?;
        if config.service_type == ServiceType::Builtin {
            return Err(LifecycleError::BuiltinImmutable(id.clone()));
        }

        if config.status != ServiceStatus::Stopped {
            if let Err(e) = self.stop_service(id).await {
                warn!(service = %id, error = %e, "stop during uninstall failed");
            }
        }
        self.installer.uninstall(id).await?;
        self.services.write().await.remove(id);
        self.shrink_registry(id);
        self.bus.publish(CatalogEvent::unregistered(id.clone()));
        info!(service = %id, "service uninstalled");
        Ok(())
    }

    /// Make an installed service's capabilities first-class registry
    /// citizens, so validation covers external tools too.
    fn extend_registry(&self, config: &ServiceConfig) {
        if self.registry.canonicalize_tool(config.service_id.as_str()).is_ok() {
            return;
        }
        if config.capabilities.is_empty() {
            warn!(
                service = %config.service_id,
                "installed service declares no capabilities, calls to it will not validate"
            );
            return;
        }
        let mut registry_config = self.registry_config.lock();
        registry_config.tools.push(ToolDefinition {
            id: config.service_id.to_string(),
            display_name: config.display_name.clone(),
            description: config.description.clone(),
            aliases: Vec::new(),
            default_action: None,
            actions: config.capabilities.clone(),
        });
        if let Err(e) = self.registry.reload(&registry_config) {
            registry_config.tools.pop();
            warn!(service = %config.service_id, error = %e, "registry extension rejected");
        }
    }

    fn shrink_registry(&self, id: &ToolId) {
        let mut registry_config = self.registry_config.lock();
        let before = registry_config.tools.len();
        registry_config.tools.retain(|t| t.id != id.as_str());
        if registry_config.tools.len() != before {
            if let Err(e) = self.registry.reload(&registry_config) {
                warn!(service = %id, error = %e, "registry shrink failed");
            }
        }
    }

    // ==================== Catalog queries ====================

    pub async fn get_service(&self, id: &ToolId) -> Option<ServiceSnapshot> {
        self.services.read().await.get(id).map(ServiceConfig::snapshot)
    }

    pub async fn list_services(&self) -> Vec<ServiceSnapshot> {
        let services = self.services.read().await;
        let mut snapshots: Vec<_> = services.values().map(ServiceConfig::snapshot).collect();
        snapshots.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        snapshots
    }

    /// Services eligible for the LLM-facing tool list: running and healthy.
    pub async fn running_services(&self) -> Vec<ServiceSnapshot> {
        self.list_services()
            .await
            .into_iter()
            .filter(|s| s.available)
            .collect()
    }

    /// Substring search over the installed catalog. No outbound discovery.
    pub async fn search_services(&self, query: &str) -> Vec<ServiceSnapshot> {
        let query = query.to_lowercase();
        self.list_services()
            .await
            .into_iter()
            .filter(|s| {
                s.name.to_lowercase().contains(&query)
                    || s.description.to_lowercase().contains(&query)
                    || s.tags.iter().any(|t| t.to_lowercase().contains(&query))
            })
            .collect()
    }

    pub async fn catalog_statistics(&self) -> CatalogStatistics {
        let services = self.services.read().await;
        let mut distribution: BTreeMap<String, usize> = BTreeMap::new();
        for config in services.values() {
            *distribution.entry(config.status.to_string()).or_default() += 1;
        }
        CatalogStatistics {
            total_services: services.len(),
            builtin_services: services
                .values()
                .filter(|c| c.service_type == ServiceType::Builtin)
                .count(),
            external_services: services
                .values()
                .filter(|c| c.service_type == ServiceType::External)
                .count(),
            container_services: services
                .values()
                .filter(|c| c.service_type == ServiceType::Container)
                .count(),
            running_services: services
                .values()
                .filter(|c| c.status == ServiceStatus::Running)
                .count(),
            healthy_services: services.values().filter(|c| c.health.is_healthy).count(),
            total_capabilities: services.values().map(|c| c.capabilities.len()).sum(),
            status_distribution: distribution,
        }
    }

    pub fn config(&self) -> &ToolhostConfig {
        &self.config
    }

    /// Cooperative shutdown: stop everything within the budget, then
    /// force-kill what remains.
    pub async fn shutdown(&self) {
        info!("shutting down service container");
        self.shutdown.cancel();

        let ids: Vec<ToolId> = self.services.read().await.keys().cloned().collect();
        let stop_all = async {
            for id in &ids {
                if let Err(e) = self.stop_service(id).await {
                    match e {
                        LifecycleError::State(_) => {}
                        other => warn!(service = %id, error = %other, "stop during shutdown failed"),
                    }
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_BUDGET, stop_all).await.is_err() {
            warn!("shutdown budget exceeded, escalating to forced kill");
            self.supervisor.kill_all().await;
        }
        info!("service container shut down");
    }

    /// Expose the supervisor's view of a service process, for diagnostics.
    pub async fn process_status(&self, id: &ToolId) -> ProcessStatus {
        self.supervisor.status(id).await
    }

    /// Number of ports currently leased, for diagnostics and tests.
    pub fn ports_leased(&self) -> usize {
        self.ports.leased_count()
    }
}

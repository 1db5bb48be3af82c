// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Container lifecycle: catalog construction from the builtin directory,
// fault isolation during auto-start, persistence across container
// generations, and the monitor-driven unhealthy/restart path.

mod support;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use aegis_toolhost_core::application::container::ServiceContainer;
use aegis_toolhost_core::application::monitor::ServiceMonitor;
use aegis_toolhost_core::domain::config::ToolhostConfig;
use aegis_toolhost_core::domain::events::CatalogEvent;
use aegis_toolhost_core::domain::identity::{IdentityRegistry, RegistryConfig, ToolId};
use aegis_toolhost_core::domain::service::{InstallMethod, ServiceStatus};
use aegis_toolhost_core::infrastructure::container_runtime::ContainerRuntime;
use aegis_toolhost_core::infrastructure::event_bus::EventBus;
use aegis_toolhost_core::infrastructure::installer::InstallSpec;

fn toolhost_config(root: &Path) -> ToolhostConfig {
    ToolhostConfig {
        storage_root: root.to_path_buf(),
        builtin_dir: root.join("builtin_servers"),
        container_runtime: PathBuf::from("/nonexistent/container-runtime"),
        port_range_start: 18500,
        port_range_end: 18560,
        ..ToolhostConfig::default()
    }
}

fn build_container(root: &Path, bus: EventBus) -> Arc<ServiceContainer> {
    let registry_config = RegistryConfig::builtin_defaults();
    let registry = Arc::new(IdentityRegistry::from_config(&registry_config).unwrap());
    Arc::new(ServiceContainer::new(
        toolhost_config(root),
        registry,
        registry_config,
        bus,
        CancellationToken::new(),
    ))
}

fn seed_builtin(root: &Path, name: &str) {
    let dir = root.join("builtin_servers").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("main.py"), "").unwrap();
}

#[tokio::test]
async fn fresh_boot_exposes_all_builtin_canonical_ids() {
    let root = tempfile::tempdir().unwrap();
    for name in ["microsandbox", "deepsearch", "browser_use", "search_tool"] {
        seed_builtin(root.path(), name);
    }
    let container = build_container(root.path(), EventBus::with_default_capacity());

    let autostart = container.initialize().await;
    assert_eq!(autostart.len(), 4);

    let services = container.list_services().await;
    assert_eq!(services.len(), 4);
    let mut ids: Vec<&str> = services.iter().map(|s| s.service_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, ["browser_use", "deepsearch", "microsandbox", "search_tool"]);
}

#[tokio::test]
async fn autostart_failures_never_take_down_the_fleet() {
    let root = tempfile::tempdir().unwrap();
    seed_builtin(root.path(), "microsandbox");
    seed_builtin(root.path(), "deepsearch");
    // One candidate has no launchable entry point at start time.
    std::fs::remove_file(
        root.path()
            .join("builtin_servers/deepsearch/main.py"),
    )
    .ok();

    let container = build_container(root.path(), EventBus::with_default_capacity());
    let autostart = container.initialize().await;

    // Discovery already skipped the broken candidate; the rest auto-start
    // (and fail individually here, there being no real python servers).
    container.autostart_all(autostart).await;

    let services = container.list_services().await;
    assert!(!services.is_empty());
    for service in services {
        // Whatever happened, nothing is stuck mid-transition.
        assert!(matches!(
            service.status,
            ServiceStatus::Running | ServiceStatus::Error | ServiceStatus::Stopped
        ));
    }
    // All leases were either promoted to running services or returned.
    let running = container.running_services().await.len();
    assert_eq!(container.ports_leased(), running);
}

#[tokio::test]
async fn installed_services_survive_a_container_restart() {
    let root = tempfile::tempdir().unwrap();
    let bus = EventBus::with_default_capacity();

    // Generation one: install an external service.
    {
        let container = build_container(root.path(), bus.clone());
        container.initialize().await;
        let spec = InstallSpec {
            service_id: Some("notes".to_string()),
            name: "Notes".to_string(),
            description: "note keeping".to_string(),
            install_method: InstallMethod::None,
            source_url: None,
            container_image: None,
            entry_point: None,
            transport: None,
            capabilities: vec![],
            tags: vec!["memory".to_string()],
            environment: HashMap::new(),
            container_port: None,
        };
        container.install_service(&spec).await.unwrap();
    }

    // Generation two: a fresh container over the same storage root.
    let container = build_container(root.path(), EventBus::with_default_capacity());
    container.initialize().await;

    let recovered = container.get_service(&ToolId::new("notes")).await.unwrap();
    assert_eq!(recovered.tags, vec!["memory".to_string()]);
    assert_eq!(recovered.status, ServiceStatus::Stopped);
}

#[tokio::test]
async fn health_regression_flows_from_monitor_to_restart_request() {
    let root = tempfile::tempdir().unwrap();
    let bus = EventBus::with_default_capacity();
    let container = build_container(root.path(), bus.clone());
    container.initialize().await;

    // Plant a running service whose endpoint refuses every probe.
    {
        let services = container.services_handle();
        let mut map = services.write().await;
        let mut config = support::running_ws_service("deepsearch", "ws://127.0.0.1:1");
        config.service_type = aegis_toolhost_core::domain::service::ServiceType::External;
        map.insert(config.service_id.clone(), config);
    }

    let (restart_tx, mut restart_rx) = mpsc::channel(8);
    let monitor = Arc::new(ServiceMonitor::new(
        container.services_handle(),
        ContainerRuntime::new(PathBuf::from("/nonexistent/container-runtime")),
        bus.clone(),
        restart_tx,
        Duration::from_secs(30),
    ));
    let mut events = bus.subscribe();

    for _ in 0..3 {
        monitor.probe_all().await;
    }

    let snapshot = container
        .get_service(&ToolId::new("deepsearch"))
        .await
        .unwrap();
    assert_eq!(snapshot.status, ServiceStatus::Unhealthy);
    assert_eq!(snapshot.consecutive_failures, 3);

    // The unhealthy edge was broadcast.
    let mut saw_unhealthy_event = false;
    while let Ok(event) = events.try_recv() {
        if let CatalogEvent::StatusChanged { to, .. } = event {
            if to == ServiceStatus::Unhealthy {
                saw_unhealthy_event = true;
            }
        }
    }
    assert!(saw_unhealthy_event);

    // And a restart was requested for the container to execute.
    assert_eq!(restart_rx.try_recv().ok(), Some(ToolId::new("deepsearch")));
}

#[tokio::test]
async fn uninstalled_service_disappears_from_catalog_and_disk() {
    let root = tempfile::tempdir().unwrap();
    let container = build_container(root.path(), EventBus::with_default_capacity());
    container.initialize().await;

    let spec = InstallSpec {
        service_id: Some("scratch".to_string()),
        name: "Scratch".to_string(),
        description: String::new(),
        install_method: InstallMethod::None,
        source_url: None,
        container_image: None,
        entry_point: None,
        transport: None,
        capabilities: vec![],
        tags: vec![],
        environment: HashMap::new(),
        container_port: None,
    };
    container.install_service(&spec).await.unwrap();
    let install_dir = root.path().join("installed_services/scratch");
    assert!(install_dir.join("installation_config.json").is_file());

    container
        .uninstall_service(&ToolId::new("scratch"))
        .await
        .unwrap();
    assert!(container.get_service(&ToolId::new("scratch")).await.is_none());
    assert!(!install_dir.exists());

    // A fresh generation sees nothing to load.
    let container = build_container(root.path(), EventBus::with_default_capacity());
    container.initialize().await;
    assert!(container.get_service(&ToolId::new("scratch")).await.is_none());
}

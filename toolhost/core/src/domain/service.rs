// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Service Domain Types
//!
//! The [`ServiceConfig`] aggregate describes one tool server: how it was
//! installed, how to reach it, how to launch it, and how it is supervised.
//! State transitions go through aggregate methods so that illegal moves are
//! domain errors rather than silent corruption.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::identity::{Capability, ToolId};

/// How a service came to exist in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Shipped in the builtin directory, discovered at boot. Never destroyed.
    Builtin,
    /// Installed from an external source as a host subprocess.
    External,
    /// Installed as a container image, run through the container runtime.
    Container,
}

/// How the service's files land on disk. Orthogonal to [`ServiceType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    None,
    ConfigOnly,
    Lightweight,
    FullClone,
    ContainerImage,
}

/// Transport the service speaks for tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Websocket,
    Http,
}

/// Service status automaton: stopped, starting, running, unhealthy,
/// stopping, error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Unhealthy,
    Stopping,
    Error,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid state transition for '{service}': {from} -> {to}")]
    InvalidStateTransition {
        service: ToolId,
        from: ServiceStatus,
        to: ServiceStatus,
    },
}

/// Probe-driven health bookkeeping for one service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub is_healthy: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub probe_count: u64,
    pub recent_response_time_ms: Option<u64>,
    pub last_error_message: Option<String>,
}

/// Outcome of recording a probe, when the health edge flipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    BecameUnhealthy,
    Recovered,
}

impl ServiceHealth {
    /// Record one probe outcome. Returns a transition when the healthy flag
    /// flipped as a result.
    pub fn record_probe(
        &mut self,
        success: bool,
        response_time_ms: Option<u64>,
        error: Option<String>,
    ) -> Option<HealthTransition> {
        let was_healthy = self.is_healthy;
        self.last_probe_at = Some(Utc::now());
        self.probe_count += 1;
        self.recent_response_time_ms = response_time_ms;

        if success {
            self.is_healthy = true;
            self.consecutive_failures = 0;
            self.last_error_message = None;
            (!was_healthy).then_some(HealthTransition::Recovered)
        } else {
            self.is_healthy = false;
            self.consecutive_failures += 1;
            self.last_error_message = error;
            was_healthy.then_some(HealthTransition::BecameUnhealthy)
        }
    }
}

/// Supervision knobs carried per service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionPolicy {
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_seconds: u64,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
    #[serde(default = "default_probe_interval")]
    pub health_probe_interval_seconds: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_restarts() -> u32 {
    3
}
fn default_restart_backoff() -> u64 {
    5
}
fn default_startup_timeout() -> u64 {
    60
}
fn default_probe_interval() -> u64 {
    30
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self {
            auto_start: true,
            auto_restart: true,
            max_restarts: default_max_restarts(),
            restart_backoff_seconds: default_restart_backoff(),
            startup_timeout_seconds: default_startup_timeout(),
            health_probe_interval_seconds: default_probe_interval(),
        }
    }
}

/// Descriptive metadata, persisted with the installation config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceMetadata {
    #[serde(default)]
    pub tags: Vec<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub documentation_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One tool server in the catalog.
///
/// Created by builtin discovery or by the installer, mutated only by the
/// service container and the monitor, persisted as
/// `installation_config.json` in the service's install directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    // Identity
    pub service_id: ToolId,
    pub display_name: String,
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,

    // Classification
    pub service_type: ServiceType,
    pub install_method: InstallMethod,

    // Network identity
    #[serde(default = "default_host")]
    pub host: String,
    pub port: Option<u16>,
    pub endpoint: Option<String>,
    pub transport: Transport,

    // Launch identity
    pub working_directory: Option<PathBuf>,
    pub entry_point: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub source_url: Option<String>,
    pub container_image: Option<String>,

    // Capabilities
    #[serde(default)]
    pub capabilities: Vec<Capability>,

    // Supervision
    #[serde(default)]
    pub policy: SupervisionPolicy,

    // Metadata
    #[serde(default)]
    pub metadata: ServiceMetadata,

    // Runtime state
    #[serde(default = "default_status")]
    pub status: ServiceStatus,
    pub process_id: Option<u32>,
    pub container_id: Option<String>,
    pub actual_endpoint: Option<String>,
    #[serde(default)]
    pub health: ServiceHealth,
}

fn default_version() -> String {
    "1.0.0".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_status() -> ServiceStatus {
    ServiceStatus::Stopped
}

impl ServiceConfig {
    /// Endpoint currently in effect: the runtime-assigned one wins.
    pub fn effective_endpoint(&self) -> Option<&str> {
        self.actual_endpoint.as_deref().or(self.endpoint.as_deref())
    }

    /// Endpoint for a given port on the configured host and transport.
    pub fn endpoint_for_port(&self, port: u16) -> String {
        match self.transport {
            Transport::Websocket => format!("ws://{}:{}", self.host, port),
            Transport::Http => format!("http://{}:{}", self.host, port),
        }
    }

    /// Whether the router may dispatch to this service right now.
    pub fn is_callable(&self) -> bool {
        self.status == ServiceStatus::Running && self.health.is_healthy
    }

    fn transition(&mut self, to: ServiceStatus, allowed_from: &[ServiceStatus]) -> Result<ServiceStatus, ServiceError> {
        let from = self.status;
        if !allowed_from.contains(&from) {
            return Err(ServiceError::InvalidStateTransition {
                service: self.service_id.clone(),
                from,
                to,
            });
        }
        self.status = to;
        Ok(from)
    }

    /// stopped -> starting (also error -> starting for manual recovery).
    pub fn begin_start(&mut self) -> Result<ServiceStatus, ServiceError> {
        self.transition(
            ServiceStatus::Starting,
            &[ServiceStatus::Stopped, ServiceStatus::Error],
        )
    }

    /// starting -> running, or unhealthy -> running on probe success.
    pub fn mark_running(&mut self) -> Result<ServiceStatus, ServiceError> {
        let from = self.transition(
            ServiceStatus::Running,
            &[ServiceStatus::Starting, ServiceStatus::Unhealthy],
        )?;
        self.health.is_healthy = true;
        Ok(from)
    }

    /// running -> unhealthy after repeated probe failures.
    pub fn mark_unhealthy(&mut self) -> Result<ServiceStatus, ServiceError> {
        self.transition(ServiceStatus::Unhealthy, &[ServiceStatus::Running])
    }

    /// Any live state -> stopping.
    pub fn begin_stop(&mut self) -> Result<ServiceStatus, ServiceError> {
        self.transition(
            ServiceStatus::Stopping,
            &[
                ServiceStatus::Starting,
                ServiceStatus::Running,
                ServiceStatus::Unhealthy,
                ServiceStatus::Error,
            ],
        )
    }

    /// stopping -> stopped. Clears runtime identity.
    pub fn mark_stopped(&mut self) -> Result<ServiceStatus, ServiceError> {
        let from = self.transition(ServiceStatus::Stopped, &[ServiceStatus::Stopping])?;
        self.process_id = None;
        self.container_id = None;
        self.actual_endpoint = None;
        self.health.is_healthy = false;
        Ok(from)
    }

    /// Terminal failure: launch timeout, crash, restart budget exhausted.
    pub fn mark_error(&mut self, message: impl Into<String>) -> ServiceStatus {
        let from = self.status;
        self.status = ServiceStatus::Error;
        self.health.is_healthy = false;
        self.health.last_error_message = Some(message.into());
        from
    }

    /// Project this config onto the wire-visible snapshot shape.
    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            service_id: self.service_id.clone(),
            name: self.display_name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            service_type: self.service_type,
            status: self.status,
            endpoint: self.effective_endpoint().map(str::to_string),
            available: self.is_callable(),
            capabilities: self.capabilities.iter().map(|c| c.name.clone()).collect(),
            tags: self.metadata.tags.clone(),
            response_time_ms: self.health.recent_response_time_ms,
            consecutive_failures: self.health.consecutive_failures,
            last_error: self.health.last_error_message.clone(),
        }
    }
}

/// Wire-facing projection of a [`ServiceConfig`]. This is what catalog
/// events and the LLM-facing tool list carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub service_id: ToolId,
    pub name: String,
    pub description: String,
    pub version: String,
    pub service_type: ServiceType,
    pub status: ServiceStatus,
    pub endpoint: Option<String>,
    pub available: bool,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    pub response_time_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Result of one install flow, persisted alongside the service config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationResult {
    pub success: bool,
    pub service_id: ToolId,
    pub endpoint: Option<String>,
    pub container_id: Option<String>,
    pub port: Option<u16>,
    pub install_path: Option<PathBuf>,
    pub error: Option<String>,
}

/// Service descriptor file shape (`service.json`), as produced by tool
/// server authors. Converted into a [`ServiceConfig`] by discovery and the
/// installer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub service_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub entry_point: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub transport: Option<Transport>,
    #[serde(default)]
    pub capabilities: Vec<DescriptorCapability>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub documentation_url: Option<String>,
}

/// Capability shape inside a descriptor file: parameter map plus redundant
/// required/optional lists, as tool authors write them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorCapability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, crate::domain::identity::ParameterSpec>,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub optional_params: Vec<String>,
    #[serde(default)]
    pub examples: Vec<serde_json::Value>,
}

impl DescriptorCapability {
    /// Fold the redundant required/optional lists into the parameter map.
    pub fn into_capability(self) -> Capability {
        let mut parameters = self.parameters;
        for name in &self.required_params {
            if let Some(spec) = parameters.get_mut(name) {
                spec.required = true;
            }
        }
        Capability {
            name: self.name,
            description: self.description,
            parameters,
            aliases: Vec::new(),
            examples: self.examples,
        }
    }
}

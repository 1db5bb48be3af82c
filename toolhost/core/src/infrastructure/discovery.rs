// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Builtin Service Discovery
//!
//! Scans the builtin directory for tool servers shipped with the platform.
//! Each direct subdirectory whose name canonicalizes to a known tool id is a
//! candidate; a `service.json` descriptor wins when present, otherwise a
//! per-tool template provides defaults. Candidates without an entry point
//! are skipped with a warning, never an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::domain::identity::{RegistrySnapshot, ToolId};
use crate::domain::service::{
    InstallMethod, ServiceConfig, ServiceDescriptor, ServiceHealth, ServiceMetadata,
    ServiceStatus, ServiceType, SupervisionPolicy, Transport,
};

/// Default port, transport and description per builtin tool.
struct BuiltinTemplate {
    display_name: &'static str,
    description: &'static str,
    default_port: u16,
    transport: Transport,
    tags: &'static [&'static str],
}

fn template_for(tool: &str) -> Option<BuiltinTemplate> {
    match tool {
        "microsandbox" => Some(BuiltinTemplate {
            display_name: "MicroSandbox",
            description: "Sandboxed code execution with per-session state",
            default_port: 8090,
            transport: Transport::Websocket,
            tags: &["sandbox", "execution", "security"],
        }),
        "deepsearch" => Some(BuiltinTemplate {
            display_name: "DeepSearch",
            description: "Multi-source research and analysis",
            default_port: 8086,
            transport: Transport::Websocket,
            tags: &["search", "analysis"],
        }),
        "browser_use" => Some(BuiltinTemplate {
            display_name: "Browser",
            description: "AI-driven browser automation",
            default_port: 8082,
            transport: Transport::Websocket,
            tags: &["browser", "automation"],
        }),
        "search_tool" => Some(BuiltinTemplate {
            display_name: "Code Search",
            description: "File content and code definition search",
            default_port: 8080,
            transport: Transport::Websocket,
            tags: &["search", "files", "code"],
        }),
        _ => None,
    }
}

/// Discovers builtin tool servers under a configured directory.
pub struct BuiltinDiscovery {
    builtin_dir: PathBuf,
}

impl BuiltinDiscovery {
    pub fn new(builtin_dir: PathBuf) -> Self {
        Self { builtin_dir }
    }

    /// Scan for builtin services. Unknown directories and candidates without
    /// an entry point are skipped; nothing here aborts the boot.
    pub fn discover(&self, registry: &RegistrySnapshot) -> HashMap<ToolId, ServiceConfig> {
        let mut discovered = HashMap::new();

        if !self.builtin_dir.is_dir() {
            warn!(dir = %self.builtin_dir.display(), "builtin directory missing, no builtins discovered");
            return discovered;
        }

        for entry in WalkDir::new(&self.builtin_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir())
        {
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let Ok(tool_id) = registry.canonicalize_tool(&dir_name) else {
                debug!(dir = %dir_name, "not a known builtin tool, skipping");
                continue;
            };

            match self.load_candidate(&tool_id, entry.path(), registry) {
                Some(config) => {
                    info!(service = %tool_id, dir = %dir_name, "discovered builtin service");
                    discovered.insert(tool_id, config);
                }
                None => {
                    warn!(service = %tool_id, dir = %dir_name, "skipping builtin without entry point");
                }
            }
        }

        info!(count = discovered.len(), "builtin discovery complete");
        discovered
    }

    fn load_candidate(
        &self,
        tool_id: &ToolId,
        dir: &Path,
        registry: &RegistrySnapshot,
    ) -> Option<ServiceConfig> {
        let descriptor_path = dir.join("service.json");
        let descriptor = if descriptor_path.is_file() {
            match std::fs::read_to_string(&descriptor_path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str::<ServiceDescriptor>(&raw).map_err(|e| e.to_string()))
            {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    warn!(service = %tool_id, error = %e, "unparsable service.json, falling back to template");
                    None
                }
            }
        } else {
            None
        };

        let entry_point = descriptor
            .as_ref()
            .and_then(|d| d.entry_point.clone())
            .unwrap_or_else(|| "main.py".to_string());
        if !dir.join(&entry_point).is_file() {
            return None;
        }

        let template = template_for(tool_id.as_str());
        let capabilities = registry
            .capabilities_of(tool_id)
            .map(|caps| caps.to_vec())
            .unwrap_or_default();

        let (display_name, description, port, transport, tags) = match (&descriptor, &template) {
            (Some(d), _) => (
                d.name.clone(),
                d.description.clone(),
                d.port,
                d.transport.unwrap_or(Transport::Websocket),
                d.tags.clone(),
            ),
            (None, Some(t)) => (
                t.display_name.to_string(),
                t.description.to_string(),
                Some(t.default_port),
                t.transport,
                t.tags.iter().map(|s| s.to_string()).collect(),
            ),
            (None, None) => (
                tool_id.to_string(),
                String::new(),
                None,
                Transport::Websocket,
                Vec::new(),
            ),
        };

        Some(ServiceConfig {
            service_id: tool_id.clone(),
            display_name,
            description,
            version: descriptor
                .as_ref()
                .map(|d| d.version.clone())
                .unwrap_or_else(|| "1.0.0".to_string()),
            service_type: ServiceType::Builtin,
            install_method: InstallMethod::None,
            host: "127.0.0.1".to_string(),
            port,
            endpoint: None,
            transport,
            working_directory: Some(dir.to_path_buf()),
            entry_point: Some(entry_point),
            environment: HashMap::new(),
            source_url: None,
            container_image: None,
            capabilities,
            policy: SupervisionPolicy::default(),
            metadata: ServiceMetadata {
                tags,
                author: descriptor.as_ref().and_then(|d| d.author.clone()),
                license: descriptor.as_ref().and_then(|d| d.license.clone()),
                documentation_url: descriptor.as_ref().and_then(|d| d.documentation_url.clone()),
                created_at: Some(chrono::Utc::now()),
                updated_at: Some(chrono::Utc::now()),
            },
            status: ServiceStatus::Stopped,
            process_id: None,
            container_id: None,
            actual_endpoint: None,
            health: ServiceHealth::default(),
        })
    }

    /// Write a `service.json` next to each discovered service that lacks
    /// one, so authors see the schema the platform expects.
    pub fn write_descriptor_files(&self, discovered: &HashMap<ToolId, ServiceConfig>) {
        for (tool_id, config) in discovered {
            let Some(dir) = &config.working_directory else {
                continue;
            };
            let path = dir.join("service.json");
            if path.exists() {
                continue;
            }
            let descriptor = serde_json::json!({
                "service_id": tool_id.as_str(),
                "name": config.display_name,
                "description": config.description,
                "version": config.version,
                "entry_point": config.entry_point,
                "host": config.host,
                "port": config.port,
                "transport": config.transport,
                "capabilities": config.capabilities,
                "tags": config.metadata.tags,
            });
            match serde_json::to_string_pretty(&descriptor) {
                Ok(raw) => {
                    if let Err(e) = std::fs::write(&path, raw) {
                        warn!(service = %tool_id, error = %e, "failed to write service.json");
                    }
                }
                Err(e) => warn!(service = %tool_id, error = %e, "failed to serialize descriptor"),
            }
        }
    }
}

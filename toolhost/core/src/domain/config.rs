// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Toolhost runtime configuration.
//
// The supervisor is configured through environment variables only (there is
// no CLI surface); every knob has a usable default so a bare `toolhostd`
// boots against the conventional directory layout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runtime configuration for the toolhost core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolhostConfig {
    /// Inclusive TCP port lease range handed to tool servers.
    pub port_range_start: u16,
    pub port_range_end: u16,

    /// Default restart budget for services that do not declare their own.
    pub max_restarts: u32,

    /// Default health probe cadence in seconds.
    pub probe_interval_seconds: u64,

    /// Root under which installed services and runtime files live.
    pub storage_root: PathBuf,

    /// Directory scanned for builtin tool servers.
    pub builtin_dir: PathBuf,

    /// Container runtime binary used for `container_image` services.
    pub container_runtime: PathBuf,

    /// Optional registry config file. Builtin defaults apply when absent.
    pub registry_config: Option<PathBuf>,

    /// Bind address of the HTTP/WebSocket presentation surface.
    pub api_addr: SocketAddr,

    /// Per-service session pool capacity.
    pub max_pool_size: usize,

    /// Default and hard-cap per-call timeouts in seconds.
    pub call_timeout_seconds: u64,
    pub max_call_timeout_seconds: u64,

    /// Idle pooled sessions older than this are swept.
    pub max_idle_seconds: u64,
}

impl Default for ToolhostConfig {
    fn default() -> Self {
        let storage_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aegis-toolhost");
        Self {
            port_range_start: 8100,
            port_range_end: 8200,
            max_restarts: 3,
            probe_interval_seconds: 30,
            builtin_dir: storage_root.join("builtin_servers"),
            storage_root,
            container_runtime: PathBuf::from("docker"),
            registry_config: None,
            api_addr: SocketAddr::from(([127, 0, 0, 1], 8088)),
            max_pool_size: 5,
            call_timeout_seconds: 30,
            max_call_timeout_seconds: 300,
            max_idle_seconds: 600,
        }
    }
}

impl ToolhostConfig {
    /// Build a configuration from the process environment, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_vars(&std::env::vars().collect::<HashMap<_, _>>())
    }

    /// Same as [`Self::from_env`] over an explicit variable map (testable).
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let defaults = Self::default();

        fn parse<T: std::str::FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> T {
            match vars.get(key).map(|v| v.parse::<T>()) {
                Some(Ok(value)) => value,
                Some(Err(_)) => {
                    tracing::warn!(key, "unparsable environment value, using default");
                    default
                }
                None => default,
            }
        }

        let storage_root = vars
            .get("TOOLHOST_STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage_root);

        let mut config = Self {
            port_range_start: parse(vars, "TOOLHOST_PORT_RANGE_START", defaults.port_range_start),
            port_range_end: parse(vars, "TOOLHOST_PORT_RANGE_END", defaults.port_range_end),
            max_restarts: parse(vars, "TOOLHOST_MAX_RESTARTS", defaults.max_restarts),
            probe_interval_seconds: parse(
                vars,
                "TOOLHOST_PROBE_INTERVAL_SECS",
                defaults.probe_interval_seconds,
            ),
            builtin_dir: vars
                .get("TOOLHOST_BUILTIN_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| storage_root.join("builtin_servers")),
            container_runtime: vars
                .get("TOOLHOST_CONTAINER_RUNTIME")
                .map(PathBuf::from)
                .unwrap_or(defaults.container_runtime),
            registry_config: vars.get("TOOLHOST_REGISTRY_CONFIG").map(PathBuf::from),
            api_addr: parse(vars, "TOOLHOST_API_ADDR", defaults.api_addr),
            max_pool_size: parse(vars, "TOOLHOST_MAX_POOL_SIZE", defaults.max_pool_size),
            call_timeout_seconds: parse(
                vars,
                "TOOLHOST_CALL_TIMEOUT_SECS",
                defaults.call_timeout_seconds,
            ),
            max_call_timeout_seconds: defaults.max_call_timeout_seconds,
            max_idle_seconds: parse(vars, "TOOLHOST_MAX_IDLE_SECS", defaults.max_idle_seconds),
            storage_root,
        };

        if config.port_range_end < config.port_range_start {
            tracing::warn!(
                start = config.port_range_start,
                end = config.port_range_end,
                "inverted port range, swapping bounds"
            );
            std::mem::swap(&mut config.port_range_start, &mut config.port_range_end);
        }
        config
    }

    /// Directory holding installed external services.
    pub fn install_dir(&self) -> PathBuf {
        self.storage_root.join("installed_services")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_for_missing_vars() {
        let config = ToolhostConfig::from_vars(&HashMap::new());
        assert_eq!(config.port_range_start, 8100);
        assert_eq!(config.port_range_end, 8200);
        assert_eq!(config.max_pool_size, 5);
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("TOOLHOST_PORT_RANGE_START".to_string(), "9000".to_string()),
            ("TOOLHOST_PORT_RANGE_END".to_string(), "9050".to_string()),
            ("TOOLHOST_STORAGE_ROOT".to_string(), "/tmp/toolhost".to_string()),
            ("TOOLHOST_CONTAINER_RUNTIME".to_string(), "podman".to_string()),
        ]);
        let config = ToolhostConfig::from_vars(&vars);
        assert_eq!(config.port_range_start, 9000);
        assert_eq!(config.port_range_end, 9050);
        assert_eq!(config.storage_root, PathBuf::from("/tmp/toolhost"));
        assert_eq!(config.install_dir(), PathBuf::from("/tmp/toolhost/installed_services"));
        assert_eq!(config.builtin_dir, PathBuf::from("/tmp/toolhost/builtin_servers"));
        assert_eq!(config.container_runtime, PathBuf::from("podman"));
    }

    #[test]
    fn test_unparsable_value_falls_back() {
        let vars = HashMap::from([(
            "TOOLHOST_PORT_RANGE_START".to_string(),
            "not-a-port".to_string(),
        )]);
        let config = ToolhostConfig::from_vars(&vars);
        assert_eq!(config.port_range_start, 8100);
    }

    #[test]
    fn test_inverted_range_is_swapped() {
        let vars = HashMap::from([
            ("TOOLHOST_PORT_RANGE_START".to_string(), "9100".to_string()),
            ("TOOLHOST_PORT_RANGE_END".to_string(), "9000".to_string()),
        ]);
        let config = ToolhostConfig::from_vars(&vars);
        assert!(config.port_range_start <= config.port_range_end);
    }
}

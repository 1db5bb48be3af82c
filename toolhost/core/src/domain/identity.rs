// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Tool Identity Registry
//!
//! The single authority on "what is a legal tool call". Canonicalizes tool
//! and action identifiers, stores capability schemas, and validates every
//! inbound call before it may touch the network.
//!
//! ## Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`ToolId`] | Canonical identifier for one tool across the fleet |
//! | [`Capability`] | Declared contract of one action (params, examples) |
//! | [`RegistryConfig`] | Serde-loadable definition of the closed tool set |
//! | [`RegistrySnapshot`] | Immutable, fully-indexed view used for lookups |
//! | [`IdentityRegistry`] | Swap-on-write holder of the current snapshot |
//!
//! Reads never block: lookups operate on an `Arc<RegistrySnapshot>` and a
//! reload publishes a new snapshot atomically, so any call observes either
//! the pre-reload or the post-reload state, never a partial merge.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical identifier for a tool (e.g. `microsandbox`, `deepsearch`).
///
/// Drawn from the closed set declared in [`RegistryConfig`]. Any other
/// spelling reaches a `ToolId` only through alias resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolId(pub String);

impl ToolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Schema of a single parameter of a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Declared value type (`string`, `integer`, `boolean`, `array`, `object`).
    /// Informational only: type enforcement is delegated to the tool server.
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// Declared contract of one action on a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub description: String,
    /// Parameter name to schema. May be empty for zero-parameter actions.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    /// Alternative spellings resolved through the per-tool alias facility.
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub examples: Vec<Value>,
}

impl Capability {
    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn optional_parameters(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|(_, spec)| !spec.required)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// One tool definition inside [`RegistryConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub display_name: String,
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Preferred action when the caller names none. Falls back to the first
    /// declared action when absent.
    #[serde(default)]
    pub default_action: Option<String>,
    pub actions: Vec<Capability>,
}

/// The closed tool set, loadable from JSON or built from in-crate defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub tools: Vec<ToolDefinition>,
    /// Presentation order for `list_tools`. Tools not listed here sort after
    /// the listed ones, alphabetically.
    #[serde(default)]
    pub display_order: Vec<String>,
}

/// Errors raised by registry loading and lookup.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    #[error("unknown tool: '{id}' (known tools: {known:?})")]
    UnknownTool { id: String, known: Vec<String> },

    #[error("unknown action '{action}' for tool '{tool}' (known actions: {known:?})")]
    UnknownAction {
        tool: ToolId,
        action: String,
        known: Vec<String>,
    },

    #[error("invalid call: {}", errors.join("; "))]
    InvalidCall { errors: Vec<String> },

    #[error("alias '{alias}' maps to both '{first}' and '{second}'")]
    DuplicateAlias {
        alias: String,
        first: String,
        second: String,
    },

    #[error("tool '{0}' declares no actions")]
    NoActions(String),

    #[error("failed to load registry config: {0}")]
    ConfigLoad(String),
}

/// Normalize an identifier for alias matching: lowercase, strip `-`/`_`/
/// whitespace, then strip leading and trailing `mcp`/`server` tokens.
fn normalize(id: &str) -> String {
    let mut normalized: String = id
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '-' | '_') && !c.is_whitespace())
        .collect();
    for prefix in ["mcp", "server"] {
        if let Some(rest) = normalized.strip_prefix(prefix) {
            normalized = rest.to_string();
        }
    }
    for suffix in ["mcp", "server"] {
        if let Some(rest) = normalized.strip_suffix(suffix) {
            normalized = rest.to_string();
        }
    }
    normalized
}

/// Fully-indexed, immutable view of one loaded configuration.
#[derive(Debug)]
pub struct RegistrySnapshot {
    tools: BTreeMap<ToolId, ToolEntry>,
    /// Normalized alias to canonical tool id. Includes the canonical ids
    /// themselves in normalized form.
    alias_index: HashMap<String, ToolId>,
    display_order: Vec<ToolId>,
}

#[derive(Debug)]
struct ToolEntry {
    id: ToolId,
    display_name: String,
    description: String,
    default_action: String,
    capabilities: Vec<Capability>,
    /// Normalized action name or alias to canonical action name.
    action_index: HashMap<String, String>,
}

/// LLM-facing descriptor returned by `list_tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: ToolId,
    pub display_name: String,
    pub description: String,
    pub actions: Vec<String>,
    pub default_action: String,
}

/// A call that passed full registry validation. Both names are canonical.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatedCall {
    pub tool: ToolId,
    pub action: String,
    pub parameters: Value,
}

/// Registry statistics for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatistics {
    pub total_tools: usize,
    pub total_aliases: usize,
    pub total_actions: usize,
    pub actions_by_tool: BTreeMap<String, usize>,
}

impl RegistrySnapshot {
    /// Build and cross-validate a snapshot. Duplicate aliases across tools
    /// and tools without actions are load-time errors.
    pub fn build(config: &RegistryConfig) -> Result<Self, IdentityError> {
        let mut tools = BTreeMap::new();
        let mut alias_index: HashMap<String, ToolId> = HashMap::new();

        fn claim(
            alias: &str,
            owner: &ToolId,
            index: &mut HashMap<String, ToolId>,
        ) -> Result<(), IdentityError> {
            let key = normalize(alias);
            if key.is_empty() {
                return Ok(());
            }
            match index.get(&key) {
                Some(existing) if existing != owner => Err(IdentityError::DuplicateAlias {
                    alias: alias.to_string(),
                    first: existing.to_string(),
                    second: owner.to_string(),
                }),
                _ => {
                    index.insert(key, owner.clone());
                    Ok(())
                }
            }
        }

        for def in &config.tools {
            if def.actions.is_empty() {
                return Err(IdentityError::NoActions(def.id.clone()));
            }
            let id = ToolId::new(&def.id);

            claim(&def.id, &id, &mut alias_index)?;
            for alias in &def.aliases {
                claim(alias, &id, &mut alias_index)?;
            }

            let mut action_index = HashMap::new();
            for cap in &def.actions {
                action_index.insert(normalize(&cap.name), cap.name.clone());
                for alias in &cap.aliases {
                    let key = normalize(alias);
                    if let Some(existing) = action_index.get(&key) {
                        if existing != &cap.name {
                            return Err(IdentityError::DuplicateAlias {
                                alias: alias.clone(),
                                first: existing.clone(),
                                second: cap.name.clone(),
                            });
                        }
                    }
                    action_index.insert(key, cap.name.clone());
                }
            }

            let default_action = match &def.default_action {
                Some(action) => action.clone(),
                None => def.actions[0].name.clone(),
            };

            tools.insert(
                id.clone(),
                ToolEntry {
                    id,
                    display_name: def.display_name.clone(),
                    description: def.description.clone(),
                    default_action,
                    capabilities: def.actions.clone(),
                    action_index,
                },
            );
        }

        // Presentation order: configured first, then the remainder sorted.
        let mut display_order: Vec<ToolId> = config
            .display_order
            .iter()
            .map(|id| ToolId::new(id))
            .filter(|id| tools.contains_key(id))
            .collect();
        for id in tools.keys() {
            if !display_order.contains(id) {
                display_order.push(id.clone());
            }
        }

        Ok(Self {
            tools,
            alias_index,
            display_order,
        })
    }

    fn known_tools(&self) -> Vec<String> {
        self.tools.keys().map(|id| id.to_string()).collect()
    }

    /// Resolve any spelling of a tool id to its canonical form.
    pub fn canonicalize_tool(&self, id: &str) -> Result<ToolId, IdentityError> {
        if id.trim().is_empty() {
            return Err(IdentityError::UnknownTool {
                id: id.to_string(),
                known: self.known_tools(),
            });
        }
        let canonical = ToolId::new(id);
        if self.tools.contains_key(&canonical) {
            return Ok(canonical);
        }
        self.alias_index
            .get(&normalize(id))
            .cloned()
            .ok_or_else(|| IdentityError::UnknownTool {
                id: id.to_string(),
                known: self.known_tools(),
            })
    }

    /// Resolve an action name or alias within one tool's alias space.
    pub fn canonicalize_action(&self, tool: &ToolId, action: &str) -> Result<String, IdentityError> {
        let entry = self.entry(tool)?;
        entry
            .action_index
            .get(&normalize(action))
            .cloned()
            .ok_or_else(|| IdentityError::UnknownAction {
                tool: tool.clone(),
                action: action.to_string(),
                known: entry.capabilities.iter().map(|c| c.name.clone()).collect(),
            })
    }

    /// Tools in configured presentation order.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.display_order
            .iter()
            .filter_map(|id| self.tools.get(id))
            .map(|entry| ToolDescriptor {
                id: entry.id.clone(),
                display_name: entry.display_name.clone(),
                description: entry.description.clone(),
                actions: entry.capabilities.iter().map(|c| c.name.clone()).collect(),
                default_action: entry.default_action.clone(),
            })
            .collect()
    }

    pub fn capabilities_of(&self, tool: &ToolId) -> Result<&[Capability], IdentityError> {
        Ok(&self.entry(tool)?.capabilities)
    }

    pub fn parameters_of(
        &self,
        tool: &ToolId,
        action: &str,
    ) -> Result<&BTreeMap<String, ParameterSpec>, IdentityError> {
        let canonical = self.canonicalize_action(tool, action)?;
        let entry = self.entry(tool)?;
        entry
            .capabilities
            .iter()
            .find(|c| c.name == canonical)
            .map(|c| &c.parameters)
            .ok_or_else(|| IdentityError::UnknownAction {
                tool: tool.clone(),
                action: action.to_string(),
                known: entry.capabilities.iter().map(|c| c.name.clone()).collect(),
            })
    }

    pub fn default_action(&self, tool: &ToolId) -> Result<String, IdentityError> {
        Ok(self.entry(tool)?.default_action.clone())
    }

    /// Full call validation: canonicalize both names, require all required
    /// parameters, reject unknown parameters. Values are not type-coerced.
    pub fn validate_call(
        &self,
        tool: &str,
        action: &str,
        parameters: &Value,
    ) -> Result<ValidatedCall, IdentityError> {
        let tool = self.canonicalize_tool(tool)?;
        let action = self.canonicalize_action(&tool, action)?;
        let schema = self.parameters_of(&tool, &action)?;

        let params_map: BTreeMap<String, Value> = match parameters {
            Value::Null => BTreeMap::new(),
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            other => {
                return Err(IdentityError::InvalidCall {
                    errors: vec![format!(
                        "parameters must be an object, got {}",
                        value_kind(other)
                    )],
                })
            }
        };

        let mut errors = Vec::new();

        let missing: Vec<&String> = schema
            .iter()
            .filter(|(name, spec)| spec.required && !params_map.contains_key(*name))
            .map(|(name, _)| name)
            .collect();
        if !missing.is_empty() {
            errors.push(format!(
                "missing required parameters: {:?}",
                missing.iter().map(|s| s.as_str()).collect::<Vec<_>>()
            ));
        }

        let unknown: Vec<&String> = params_map
            .keys()
            .filter(|name| !schema.contains_key(*name))
            .collect();
        if !unknown.is_empty() {
            errors.push(format!(
                "unknown parameters: {:?} (valid: {:?})",
                unknown.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                schema.keys().map(|s| s.as_str()).collect::<Vec<_>>()
            ));
        }

        if !errors.is_empty() {
            return Err(IdentityError::InvalidCall { errors });
        }

        Ok(ValidatedCall {
            tool,
            action,
            parameters: Value::Object(params_map.into_iter().collect()),
        })
    }

    pub fn statistics(&self) -> RegistryStatistics {
        RegistryStatistics {
            total_tools: self.tools.len(),
            total_aliases: self.alias_index.len(),
            total_actions: self.tools.values().map(|t| t.capabilities.len()).sum(),
            actions_by_tool: self
                .tools
                .iter()
                .map(|(id, entry)| (id.to_string(), entry.capabilities.len()))
                .collect(),
        }
    }

    fn entry(&self, tool: &ToolId) -> Result<&ToolEntry, IdentityError> {
        self.tools.get(tool).ok_or_else(|| IdentityError::UnknownTool {
            id: tool.to_string(),
            known: self.known_tools(),
        })
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Read-mostly holder of the current [`RegistrySnapshot`].
///
/// Mutation happens only on load and hot-reload and publishes a whole new
/// snapshot; readers clone the `Arc` and never hold the lock across awaits.
pub struct IdentityRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl IdentityRegistry {
    pub fn from_config(config: &RegistryConfig) -> Result<Self, IdentityError> {
        Ok(Self {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::build(config)?)),
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self, IdentityError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IdentityError::ConfigLoad(format!("{}: {e}", path.display())))?;
        let config: RegistryConfig = serde_json::from_str(&raw)
            .map_err(|e| IdentityError::ConfigLoad(format!("{}: {e}", path.display())))?;
        Self::from_config(&config)
    }

    /// Current snapshot. Cheap; safe to call on every lookup.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().clone()
    }

    /// Atomically replace the snapshot. Readers in flight keep the old one.
    pub fn reload(&self, config: &RegistryConfig) -> Result<(), IdentityError> {
        let next = Arc::new(RegistrySnapshot::build(config)?);
        *self.snapshot.write() = next;
        Ok(())
    }

    pub fn canonicalize_tool(&self, id: &str) -> Result<ToolId, IdentityError> {
        self.snapshot().canonicalize_tool(id)
    }

    pub fn canonicalize_action(&self, tool: &ToolId, action: &str) -> Result<String, IdentityError> {
        self.snapshot().canonicalize_action(tool, action)
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.snapshot().list_tools()
    }

    pub fn validate_call(
        &self,
        tool: &str,
        action: &str,
        parameters: &Value,
    ) -> Result<ValidatedCall, IdentityError> {
        self.snapshot().validate_call(tool, action, parameters)
    }

    pub fn statistics(&self) -> RegistryStatistics {
        self.snapshot().statistics()
    }
}

impl RegistryConfig {
    /// Definitions for the four builtin tool servers. Used when no registry
    /// config file is provided.
    pub fn builtin_defaults() -> Self {
        fn param(ty: &str, desc: &str, required: bool) -> ParameterSpec {
            ParameterSpec {
                param_type: ty.to_string(),
                description: desc.to_string(),
                required,
            }
        }

        let microsandbox = ToolDefinition {
            id: "microsandbox".to_string(),
            display_name: "MicroSandbox".to_string(),
            description: "Sandboxed code execution with per-session state".to_string(),
            aliases: vec!["sandbox".to_string(), "code_executor".to_string()],
            default_action: Some("microsandbox_execute".to_string()),
            actions: vec![
                Capability {
                    name: "microsandbox_execute".to_string(),
                    description: "Execute code inside an isolated sandbox session".to_string(),
                    parameters: BTreeMap::from([
                        ("code".to_string(), param("string", "Source code to execute", true)),
                        (
                            "language".to_string(),
                            param("string", "Language of the snippet, defaults to python", false),
                        ),
                        (
                            "session_id".to_string(),
                            param("string", "Reuse an existing sandbox session", false),
                        ),
                        (
                            "timeout".to_string(),
                            param("integer", "Execution timeout in seconds", false),
                        ),
                    ]),
                    aliases: vec!["execute".to_string(), "run_code".to_string()],
                    examples: vec![serde_json::json!({"code": "print(1 + 1)"})],
                },
                Capability {
                    name: "microsandbox_install_package".to_string(),
                    description: "Install a package into a sandbox session".to_string(),
                    parameters: BTreeMap::from([
                        (
                            "package_name".to_string(),
                            param("string", "Package to install", true),
                        ),
                        (
                            "session_id".to_string(),
                            param("string", "Target sandbox session", false),
                        ),
                    ]),
                    aliases: vec!["install_package".to_string()],
                    examples: vec![],
                },
                Capability {
                    name: "microsandbox_list_sessions".to_string(),
                    description: "List active sandbox sessions".to_string(),
                    parameters: BTreeMap::new(),
                    aliases: vec!["list_sessions".to_string()],
                    examples: vec![],
                },
                Capability {
                    name: "microsandbox_close_session".to_string(),
                    description: "Close a sandbox session and free its resources".to_string(),
                    parameters: BTreeMap::from([(
                        "session_id".to_string(),
                        param("string", "Session to close", true),
                    )]),
                    aliases: vec!["close_session".to_string()],
                    examples: vec![],
                },
            ],
        };

        let deepsearch = ToolDefinition {
            id: "deepsearch".to_string(),
            display_name: "DeepSearch".to_string(),
            description: "Multi-source research and analysis".to_string(),
            aliases: vec!["deep_search".to_string(), "research_tool".to_string()],
            default_action: Some("research".to_string()),
            actions: vec![
                Capability {
                    name: "research".to_string(),
                    description: "Research a question across configured sources".to_string(),
                    parameters: BTreeMap::from([
                        ("question".to_string(), param("string", "Research question", true)),
                        (
                            "max_sources".to_string(),
                            param("integer", "Upper bound on sources consulted", false),
                        ),
                    ]),
                    aliases: vec!["search".to_string()],
                    examples: vec![serde_json::json!({"question": "What is MCP?"})],
                },
                Capability {
                    name: "quick_research".to_string(),
                    description: "Single-pass research for simple questions".to_string(),
                    parameters: BTreeMap::from([(
                        "question".to_string(),
                        param("string", "Research question", true),
                    )]),
                    aliases: vec![],
                    examples: vec![],
                },
                Capability {
                    name: "comprehensive_research".to_string(),
                    description: "Iterative deep research with source expansion".to_string(),
                    parameters: BTreeMap::from([
                        ("question".to_string(), param("string", "Research question", true)),
                        (
                            "depth".to_string(),
                            param("integer", "Iteration depth", false),
                        ),
                    ]),
                    aliases: vec![],
                    examples: vec![],
                },
            ],
        };

        let browser_use = ToolDefinition {
            id: "browser_use".to_string(),
            display_name: "Browser".to_string(),
            description: "AI-driven browser automation".to_string(),
            aliases: vec!["browser".to_string(), "browser_automation".to_string()],
            default_action: Some("browser_use_execute_task".to_string()),
            actions: vec![
                Capability {
                    name: "browser_use_execute_task".to_string(),
                    description: "Execute a natural-language browser task".to_string(),
                    parameters: BTreeMap::from([
                        ("task".to_string(), param("string", "Task description", true)),
                        (
                            "max_steps".to_string(),
                            param("integer", "Maximum automation steps", false),
                        ),
                        (
                            "use_vision".to_string(),
                            param("boolean", "Enable visual page understanding", false),
                        ),
                    ]),
                    aliases: vec!["execute_task".to_string()],
                    examples: vec![],
                },
                Capability {
                    name: "browser_navigate".to_string(),
                    description: "Navigate the browser to a URL".to_string(),
                    parameters: BTreeMap::from([(
                        "url".to_string(),
                        param("string", "Destination URL", true),
                    )]),
                    aliases: vec!["go_to_url".to_string(), "navigate".to_string()],
                    examples: vec![],
                },
                Capability {
                    name: "browser_get_page_content".to_string(),
                    description: "Extract the text content of the current page".to_string(),
                    parameters: BTreeMap::new(),
                    aliases: vec!["get_page_content".to_string()],
                    examples: vec![],
                },
                Capability {
                    name: "browser_screenshot".to_string(),
                    description: "Capture a screenshot of the current page".to_string(),
                    parameters: BTreeMap::new(),
                    aliases: vec!["get_screenshot".to_string()],
                    examples: vec![],
                },
            ],
        };

        let search_tool = ToolDefinition {
            id: "search_tool".to_string(),
            display_name: "Code Search".to_string(),
            description: "File content and code definition search".to_string(),
            aliases: vec!["file_search".to_string(), "code_search".to_string()],
            default_action: Some("search_file_content".to_string()),
            actions: vec![
                Capability {
                    name: "search_file_content".to_string(),
                    description: "Search file contents under a directory".to_string(),
                    parameters: BTreeMap::from([
                        ("query".to_string(), param("string", "Search query", true)),
                        ("path".to_string(), param("string", "Directory to search", false)),
                        (
                            "file_pattern".to_string(),
                            param("string", "Glob filter for file names", false),
                        ),
                    ]),
                    aliases: vec!["search_files".to_string()],
                    examples: vec![],
                },
                Capability {
                    name: "find_definition".to_string(),
                    description: "Locate the definition of a code symbol".to_string(),
                    parameters: BTreeMap::from([
                        ("symbol".to_string(), param("string", "Symbol name", true)),
                        (
                            "language".to_string(),
                            param("string", "Programming language hint", false),
                        ),
                    ]),
                    aliases: vec![],
                    examples: vec![],
                },
            ],
        };

        Self {
            display_order: vec![
                "microsandbox".to_string(),
                "deepsearch".to_string(),
                "browser_use".to_string(),
                "search_tool".to_string(),
            ],
            tools: vec![microsandbox, deepsearch, browser_use, search_tool],
        }
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Tool Invocation Types
//!
//! The call contract between LLM-facing clients and the router: request
//! shape, result envelope, and the error taxonomy every call resolves to.
//! The router returns these errors across its API boundary; it never panics
//! through it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::identity::{IdentityError, ToolId};

/// A raw inbound tool call, before registry validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
    /// Per-call timeout override in seconds. Capped by the router.
    pub timeout_seconds: Option<u64>,
}

/// Successful result of a dispatched call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOutcome {
    pub tool: ToolId,
    pub action: String,
    pub result: Value,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Error kind reported by a tool server on a well-formed call, preserved
/// from the server's error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Server rejected the parameters after its own (typed) validation.
    InvalidParams,
    /// The requested method is unknown to the server.
    MethodNotFound,
    /// The server failed internally while executing the tool.
    ExecutionFailed,
    /// Any other server-declared kind, verbatim.
    Other(String),
}

/// The call error taxonomy. Kinds, not types: every per-call failure mode a
/// caller can observe maps to exactly one variant.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallError {
    /// The call failed registry validation. Never retried, no network I/O.
    #[error("invalid call: {}", errors.join("; "))]
    InvalidCall { errors: Vec<String> },

    #[error("unknown tool: {tool}")]
    UnknownTool { tool: String, known: Vec<String> },

    #[error("unknown action '{action}' for tool '{tool}'")]
    UnknownAction {
        tool: String,
        action: String,
        known: Vec<String>,
    },

    /// Service not running or unhealthy, or the pool could not hand out a
    /// session in time. The caller may retry.
    #[error("service unavailable for '{tool}': {reason}")]
    ServiceUnavailable { tool: String, reason: String },

    /// Connection-level failure that survived one local retry.
    #[error("transport error calling '{tool}': {message}")]
    TransportError { tool: String, message: String },

    #[error("call to '{tool}' timed out after {timeout_seconds}s")]
    Timeout { tool: String, timeout_seconds: u64 },

    /// The server returned a structured error on a well-formed call.
    #[error("tool '{tool}' returned an error: {message}")]
    ToolError {
        tool: String,
        /// Server-declared classification, preserved verbatim. Serialized
        /// as `error_kind` so it cannot shadow the taxonomy tag.
        #[serde(rename = "error_kind")]
        kind: ToolErrorKind,
        message: String,
        data: Option<Value>,
    },

    #[error("call to '{tool}' was cancelled")]
    Cancelled { tool: String },

    /// Unexpected condition inside the supervisor itself.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CallError {
    /// Whether a caller-side retry can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable { .. } | Self::TransportError { .. } | Self::Timeout { .. }
        )
    }
}

impl From<IdentityError> for CallError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::UnknownTool { id, known } => Self::UnknownTool { tool: id, known },
            IdentityError::UnknownAction { tool, action, known } => Self::UnknownAction {
                tool: tool.to_string(),
                action,
                known,
            },
            IdentityError::InvalidCall { errors } => Self::InvalidCall { errors },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Classify a JSON-RPC error object into a [`ToolErrorKind`].
///
/// Servers may declare a kind in `data.error_type`; otherwise the standard
/// JSON-RPC code ranges decide.
pub fn classify_server_error(code: i64, data: Option<&Value>) -> ToolErrorKind {
    if let Some(declared) = data
        .and_then(|d| d.get("error_type"))
        .and_then(Value::as_str)
    {
        return match declared {
            "invalid_params" => ToolErrorKind::InvalidParams,
            "method_not_found" => ToolErrorKind::MethodNotFound,
            "execution_failed" => ToolErrorKind::ExecutionFailed,
            other => ToolErrorKind::Other(other.to_string()),
        };
    }
    match code {
        -32602 => ToolErrorKind::InvalidParams,
        -32601 => ToolErrorKind::MethodNotFound,
        -32603 => ToolErrorKind::ExecutionFailed,
        code if (-32099..=-32000).contains(&code) => ToolErrorKind::ExecutionFailed,
        other => ToolErrorKind::Other(format!("code_{other}")),
    }
}

/// The single entry point for executing tool capabilities.
///
/// Implementations: the in-process [`crate::application::router::ToolRouter`]
/// and any out-of-process adapters. Dependents receive it by reference; there
/// is no process-global executor.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call(&self, call: ToolCall) -> Result<CallOutcome, CallError>;
}

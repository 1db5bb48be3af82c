// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Wire schema of the broadcast event stream.
//
// This schema is normative for remote subscribers; the in-process
// CatalogEvent carries richer fields but projects onto it losslessly.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::events::CatalogEvent;
use crate::domain::identity::ToolId;
use crate::domain::service::ServiceSnapshot;

/// Server-to-client messages on `/ws/events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Welcome {
        tools: Vec<ServiceSnapshot>,
        timestamp: i64,
    },
    Register {
        tool_id: ToolId,
        service: ServiceSnapshot,
        timestamp: i64,
    },
    Unregister {
        tool_id: ToolId,
        timestamp: i64,
    },
    Status {
        tool_id: ToolId,
        service: ServiceSnapshot,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    Error {
        message: String,
        timestamp: i64,
    },
    ToolsList {
        tools: Vec<ServiceSnapshot>,
        timestamp: i64,
    },
}

impl StreamMessage {
    pub fn welcome(tools: Vec<ServiceSnapshot>) -> Self {
        Self::Welcome {
            tools,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn tools_list(tools: Vec<ServiceSnapshot>) -> Self {
        Self::ToolsList {
            tools,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now().timestamp(),
        }
    }

    /// Project an in-process catalog event onto the wire schema.
    /// Capability changes surface as status messages carrying the fresh
    /// snapshot.
    pub fn from_event(event: &CatalogEvent) -> Self {
        let timestamp = event.occurred_at().timestamp();
        match event {
            CatalogEvent::Registered { service_id, snapshot, .. } => Self::Register {
                tool_id: service_id.clone(),
                service: snapshot.clone(),
                timestamp,
            },
            CatalogEvent::Unregistered { service_id, .. } => Self::Unregister {
                tool_id: service_id.clone(),
                timestamp,
            },
            CatalogEvent::StatusChanged { service_id, snapshot, .. }
            | CatalogEvent::CapabilityChanged { service_id, snapshot, .. } => Self::Status {
                tool_id: service_id.clone(),
                service: snapshot.clone(),
                timestamp,
            },
        }
    }

    /// Wire type tag, used for subscription filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
            Self::Status { .. } => "status",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
            Self::ToolsList { .. } => "tools_list",
        }
    }
}

/// Client-to-server messages on `/ws/events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    GetTools,
    Subscribe { events: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::{ServiceStatus, ServiceType};

    fn snapshot() -> ServiceSnapshot {
        ServiceSnapshot {
            service_id: ToolId::new("microsandbox"),
            name: "MicroSandbox".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            service_type: ServiceType::Builtin,
            status: ServiceStatus::Running,
            endpoint: Some("ws://127.0.0.1:8131".to_string()),
            available: true,
            capabilities: vec!["microsandbox_execute".to_string()],
            tags: vec![],
            response_time_ms: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_wire_type_tags() {
        let value = serde_json::to_value(StreamMessage::pong()).unwrap();
        assert_eq!(value["type"], "pong");
        assert!(value["timestamp"].is_i64());

        let value = serde_json::to_value(StreamMessage::welcome(vec![snapshot()])).unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["tools"][0]["service_id"], "microsandbox");
    }

    #[test]
    fn test_event_projection_is_lossless_for_wire_fields() {
        let event = CatalogEvent::registered(snapshot());
        let message = StreamMessage::from_event(&event);
        assert_eq!(message.kind(), "register");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["tool_id"], "microsandbox");
        assert_eq!(value["service"]["status"], "running");

        let event = CatalogEvent::status_changed(ServiceStatus::Starting, snapshot());
        let message = StreamMessage::from_event(&event);
        assert_eq!(message.kind(), "status");

        let event = CatalogEvent::capability_changed(snapshot());
        assert_eq!(StreamMessage::from_event(&event).kind(), "status");
    }

    #[test]
    fn test_client_message_parsing() {
        let ping: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));

        let subscribe: ClientMessage =
            serde_json::from_str(r#"{"type": "subscribe", "events": ["status"]}"#).unwrap();
        match subscribe {
            ClientMessage::Subscribe { events } => assert_eq!(events, vec!["status"]),
            other => panic!("expected subscribe, got {other:?}"),
        }
    }
}

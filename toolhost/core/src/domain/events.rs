// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::identity::ToolId;
use crate::domain::service::{ServiceSnapshot, ServiceStatus};

/// Catalog change event, broadcast on the event bus.
///
/// The in-process type carries full service snapshots; the wire schema the
/// presentation layer emits is a lossless projection of these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogEvent {
    Registered {
        service_id: ToolId,
        snapshot: ServiceSnapshot,
        at: DateTime<Utc>,
    },
    Unregistered {
        service_id: ToolId,
        at: DateTime<Utc>,
    },
    StatusChanged {
        service_id: ToolId,
        from: ServiceStatus,
        to: ServiceStatus,
        snapshot: ServiceSnapshot,
        at: DateTime<Utc>,
    },
    CapabilityChanged {
        service_id: ToolId,
        snapshot: ServiceSnapshot,
        at: DateTime<Utc>,
    },
}

impl CatalogEvent {
    pub fn registered(snapshot: ServiceSnapshot) -> Self {
        Self::Registered {
            service_id: snapshot.service_id.clone(),
            snapshot,
            at: Utc::now(),
        }
    }

    pub fn unregistered(service_id: ToolId) -> Self {
        Self::Unregistered {
            service_id,
            at: Utc::now(),
        }
    }

    pub fn status_changed(from: ServiceStatus, snapshot: ServiceSnapshot) -> Self {
        Self::StatusChanged {
            service_id: snapshot.service_id.clone(),
            from,
            to: snapshot.status,
            snapshot,
            at: Utc::now(),
        }
    }

    pub fn capability_changed(snapshot: ServiceSnapshot) -> Self {
        Self::CapabilityChanged {
            service_id: snapshot.service_id.clone(),
            snapshot,
            at: Utc::now(),
        }
    }

    pub fn service_id(&self) -> &ToolId {
        match self {
            Self::Registered { service_id, .. }
            | Self::Unregistered { service_id, .. }
            | Self::StatusChanged { service_id, .. }
            | Self::CapabilityChanged { service_id, .. } => service_id,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::Registered { at, .. }
            | Self::Unregistered { at, .. }
            | Self::StatusChanged { at, .. }
            | Self::CapabilityChanged { at, .. } => *at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::ServiceType;

    fn snapshot() -> ServiceSnapshot {
        ServiceSnapshot {
            service_id: ToolId::new("deepsearch"),
            name: "DeepSearch".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            service_type: ServiceType::Builtin,
            status: ServiceStatus::Running,
            endpoint: Some("ws://127.0.0.1:8131".to_string()),
            available: true,
            capabilities: vec!["research".to_string()],
            tags: vec![],
            response_time_ms: Some(4),
            consecutive_failures: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_events_carry_service_id() {
        let event = CatalogEvent::status_changed(ServiceStatus::Starting, snapshot());
        assert_eq!(event.service_id(), &ToolId::new("deepsearch"));
    }

    #[test]
    fn test_event_serialization_is_kind_tagged() {
        let event = CatalogEvent::registered(snapshot());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "registered");
        assert_eq!(value["snapshot"]["service_id"], "deepsearch");
    }
}

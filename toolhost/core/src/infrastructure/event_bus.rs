// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Catalog Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Enables real-time catalog deltas to in-process subscribers and the
// WebSocket presentation layer.
//
// Delivery is at-least-once to in-process subscribers; remote subscribers
// reconcile on reconnect by pulling a full catalog snapshot.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::events::CatalogEvent;
use crate::domain::identity::ToolId;

/// Event bus for publishing and subscribing to catalog events.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<CatalogEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity. Capacity
    /// bounds how many events can buffer before slow receivers lag.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create an event bus with the default capacity (1000).
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish a catalog event to all subscribers.
    pub fn publish(&self, event: CatalogEvent) {
        // send() returns the receiver count; zero subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all catalog events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to events for a single service.
    pub fn subscribe_service(&self, service_id: ToolId) -> ServiceEventReceiver {
        ServiceEventReceiver {
            receiver: self.sender.subscribe(),
            service_id,
        }
    }

    /// Subscribe as a `Stream`, for SSE-style consumers.
    pub fn stream(&self) -> tokio_stream::wrappers::BroadcastStream<CatalogEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.sender.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for all catalog events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<CatalogEvent>,
}

impl EventReceiver {
    /// Receive the next event (blocks until one is available).
    pub async fn recv(&mut self) -> Result<CatalogEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Result<CatalogEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver filtered to one service's events.
pub struct ServiceEventReceiver {
    receiver: broadcast::Receiver<CatalogEvent>,
    service_id: ToolId,
}

impl ServiceEventReceiver {
    pub async fn recv(&mut self) -> Result<CatalogEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.service_id() == &self.service_id {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events.
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus is closed")]
    Closed,

    #[error("no events available")]
    Empty,

    #[error("receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::{ServiceSnapshot, ServiceStatus, ServiceType};

    fn snapshot(id: &str) -> ServiceSnapshot {
        ServiceSnapshot {
            service_id: ToolId::new(id),
            name: id.to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            service_type: ServiceType::Builtin,
            status: ServiceStatus::Running,
            endpoint: None,
            available: true,
            capabilities: vec![],
            tags: vec![],
            response_time_ms: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        bus.publish(CatalogEvent::registered(snapshot("microsandbox")));

        let received = receiver.recv().await.unwrap();
        match received {
            CatalogEvent::Registered { service_id, .. } => {
                assert_eq!(service_id, ToolId::new("microsandbox"));
            }
            other => panic!("expected Registered event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_service_filtering() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe_service(ToolId::new("deepsearch"));

        // Published first, filtered out.
        bus.publish(CatalogEvent::registered(snapshot("microsandbox")));
        bus.publish(CatalogEvent::registered(snapshot("deepsearch")));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.service_id(), &ToolId::new("deepsearch"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(10);
        let mut receiver1 = bus.subscribe();
        let mut receiver2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(CatalogEvent::unregistered(ToolId::new("search_tool")));

        assert!(receiver1.recv().await.is_ok());
        assert!(receiver2.recv().await.is_ok());
    }
}

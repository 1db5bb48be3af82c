// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::application::container::ServiceContainer;
use crate::application::monitor::ServiceMonitor;
use crate::application::router::ToolRouter;
use crate::domain::identity::ToolId;
use crate::domain::invocation::{ToolCall, ToolExecutor};
use crate::infrastructure::event_bus::EventBus;
use crate::presentation::stream::{ClientMessage, StreamMessage};

pub struct AppState {
    pub container: Arc<ServiceContainer>,
    pub router: Arc<ToolRouter>,
    pub monitor: Arc<ServiceMonitor>,
    pub bus: EventBus,
}

pub fn app(
    container: Arc<ServiceContainer>,
    router: Arc<ToolRouter>,
    monitor: Arc<ServiceMonitor>,
    bus: EventBus,
) -> Router {
    let state = Arc::new(AppState {
        container,
        router,
        monitor,
        bus,
    });

    Router::new()
        .route("/health", get(health))
        .route("/api/services", get(list_services))
        .route("/api/services/{id}", get(get_service))
        .route("/api/tools", get(list_tools))
        .route("/api/calls", post(execute_call))
        .route("/api/statistics", get(statistics))
        .route("/ws/events", get(events_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(serde::Deserialize)]
struct ServicesQuery {
    /// Substring filter over name, description and tags.
    q: Option<String>,
}

async fn list_services(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ServicesQuery>,
) -> impl IntoResponse {
    let services = match query.q.as_deref() {
        Some(q) if !q.is_empty() => state.container.search_services(q).await,
        _ => state.container.list_services().await,
    };
    Json(json!({ "services": services }))
}

async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.container.get_service(&ToolId::new(id)).await {
        Some(snapshot) => Json(json!({ "service": snapshot })),
        None => Json(json!({ "error": "service not found" })),
    }
}

/// LLM-facing tool list: registry descriptors for services that are
/// currently running and healthy, in configured presentation order.
async fn list_tools(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let available: HashSet<ToolId> = state
        .container
        .running_services()
        .await
        .into_iter()
        .map(|s| s.service_id)
        .collect();
    let tools: Vec<_> = state
        .container
        .registry_handle()
        .list_tools()
        .into_iter()
        .filter(|t| available.contains(&t.id))
        .collect();
    Json(json!({ "tools": tools }))
}

async fn execute_call(
    State(state): State<Arc<AppState>>,
    Json(call): Json<ToolCall>,
) -> impl IntoResponse {
    match state.router.call(call).await {
        Ok(outcome) => Json(json!({ "success": true, "outcome": outcome })),
        Err(error) => Json(json!({ "success": false, "error": error })),
    }
}

async fn statistics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "catalog": state.container.catalog_statistics().await,
        "monitoring": state.monitor.statistics().await,
        "pools": state.router.pool_statistics().await,
        "registry": state.container.registry_handle().statistics(),
    }))
}

async fn events_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state))
}

/// One subscriber on the broadcast stream. New subscribers receive an
/// initial snapshot; afterwards they get every catalog delta their
/// subscription covers, and may ping or re-pull the tool list at any time.
async fn handle_events_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut source) = socket.split();
    let mut events = state.bus.subscribe();

    // Default subscription: every catalog delta.
    let mut subscribed: Option<HashSet<String>> = None;

    let welcome = StreamMessage::welcome(state.container.running_services().await);
    if send_message(&mut sink, &welcome).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let message = StreamMessage::from_event(&event);
                    let wanted = subscribed
                        .as_ref()
                        .map(|kinds| kinds.contains(message.kind()))
                        .unwrap_or(true);
                    if wanted && send_message(&mut sink, &message).await.is_err() {
                        break;
                    }
                }
                Err(crate::infrastructure::event_bus::EventBusError::Lagged(n)) => {
                    // The subscriber fell behind; hand it a fresh snapshot
                    // so it can reconcile.
                    warn!(lagged = n, "event stream subscriber lagged");
                    let refresh =
                        StreamMessage::tools_list(state.container.running_services().await);
                    if send_message(&mut sink, &refresh).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(raw))) => {
                    match serde_json::from_str::<ClientMessage>(&raw) {
                        Ok(ClientMessage::Ping) => {
                            if send_message(&mut sink, &StreamMessage::pong()).await.is_err() {
                                break;
                            }
                        }
                        Ok(ClientMessage::GetTools) => {
                            let message = StreamMessage::tools_list(
                                state.container.running_services().await,
                            );
                            if send_message(&mut sink, &message).await.is_err() {
                                break;
                            }
                        }
                        Ok(ClientMessage::Subscribe { events }) => {
                            debug!(?events, "subscriber narrowed its event set");
                            subscribed = Some(events.into_iter().collect());
                        }
                        Err(e) => {
                            let message = StreamMessage::error(format!("unparsable message: {e}"));
                            if send_message(&mut sink, &message).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "event stream socket error");
                    break;
                }
            },
        }
    }
}

async fn send_message(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &StreamMessage,
) -> Result<(), axum::Error> {
    let raw = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    sink.send(Message::Text(raw.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::monitor::ServiceMonitor;
    use crate::application::router::{RouterConfig, ToolRouter};
    use crate::domain::config::ToolhostConfig;
    use crate::domain::identity::{IdentityRegistry, RegistryConfig};
    use crate::infrastructure::container_runtime::ContainerRuntime;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    async fn test_app() -> Router {
        let root = tempfile::tempdir().unwrap();
        let registry_config = RegistryConfig::builtin_defaults();
        let registry = Arc::new(IdentityRegistry::from_config(&registry_config).unwrap());
        let bus = EventBus::with_default_capacity();
        let config = ToolhostConfig {
            storage_root: root.path().to_path_buf(),
            builtin_dir: root.path().join("builtin_servers"),
            container_runtime: PathBuf::from("/nonexistent/container-runtime"),
            ..ToolhostConfig::default()
        };
        let container = Arc::new(ServiceContainer::new(
            config.clone(),
            registry.clone(),
            registry_config,
            bus.clone(),
            CancellationToken::new(),
        ));
        container.initialize().await;
        let router = Arc::new(ToolRouter::new(
            registry,
            container.services_handle(),
            RouterConfig::from(&config),
        ));
        let monitor = Arc::new(ServiceMonitor::new(
            container.services_handle(),
            ContainerRuntime::new(PathBuf::from("/nonexistent/container-runtime")),
            bus.clone(),
            tokio::sync::mpsc::channel(4).0,
            Duration::from_secs(30),
        ));
        app(container, router, monitor, bus)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_services_and_tools_endpoints() {
        let app = test_app().await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/services")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // No services running, so the LLM-facing list is empty.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/tools")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["tools"], json!([]));
    }

    #[tokio::test]
    async fn test_call_endpoint_surfaces_validation_errors() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/calls")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"tool": "microsandbox", "action": "execute", "parameters": {}})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"]["kind"], json!("invalid_call"));
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-process fake tool server speaking the JSON-RPC tool protocol over
// WebSocket, for driving the session and router layers in tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use aegis_toolhost_core::domain::identity::ToolId;
use aegis_toolhost_core::domain::service::{
    InstallMethod, ServiceConfig, ServiceHealth, ServiceMetadata, ServiceStatus, ServiceType,
    SupervisionPolicy, Transport,
};

pub struct FakeToolServer {
    pub url: String,
    /// WebSocket connections accepted so far.
    pub connections: Arc<AtomicUsize>,
    /// Completed tools/call invocations.
    pub calls: Arc<AtomicUsize>,
    /// High-water mark of concurrent in-flight tools/call requests.
    pub max_in_flight: Arc<AtomicUsize>,
    /// Action name of the most recent tools/call.
    pub last_call_name: Arc<Mutex<Option<String>>>,
    handle: JoinHandle<()>,
}

impl Drop for FakeToolServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawn a fake tool server. `call_delay` stretches every tools/call so
/// concurrency is observable; the first `fail_first_calls` tools/call
/// requests drop the connection without a response.
pub async fn spawn_ws_server(call_delay: Duration, fail_first_calls: usize) -> FakeToolServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let connections = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let last_call_name = Arc::new(Mutex::new(None));
    let fail_remaining = Arc::new(AtomicUsize::new(fail_first_calls));

    let server = FakeToolServer {
        url: format!("ws://{addr}"),
        connections: connections.clone(),
        calls: calls.clone(),
        max_in_flight: max_in_flight.clone(),
        last_call_name: last_call_name.clone(),
        handle: tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                connections.fetch_add(1, Ordering::SeqCst);

                let calls = calls.clone();
                let in_flight = in_flight.clone();
                let max_in_flight = max_in_flight.clone();
                let last_call_name = last_call_name.clone();
                let fail_remaining = fail_remaining.clone();

                tokio::spawn(async move {
                    let mut ws = match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };
                    while let Some(Ok(message)) = ws.next().await {
                        let raw = match message {
                            Message::Text(raw) => raw,
                            Message::Close(_) => break,
                            _ => continue,
                        };
                        let value: serde_json::Value = match serde_json::from_str(&raw) {
                            Ok(value) => value,
                            Err(_) => continue,
                        };
                        let id = value["id"].clone();
                        if id.is_null() {
                            // Notification, nothing to answer.
                            continue;
                        }
                        let method = value["method"].as_str().unwrap_or_default();

                        let response = match method {
                            "initialize" => json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "result": {
                                    "serverInfo": {"name": "fake-tool-server", "version": "0.0.1"},
                                    "capabilities": {"tools": {}}
                                }
                            }),
                            "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
                            "tools/list" => json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "result": {"tools": []}
                            }),
                            "tools/call" => {
                                let dropped = fail_remaining
                                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                                        v.checked_sub(1)
                                    })
                                    .is_ok();
                                if dropped {
                                    let _ = ws.close(None).await;
                                    return;
                                }

                                let name = value["params"]["name"]
                                    .as_str()
                                    .unwrap_or_default()
                                    .to_string();
                                *last_call_name.lock().unwrap() = Some(name.clone());

                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                max_in_flight.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(call_delay).await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                calls.fetch_add(1, Ordering::SeqCst);

                                let question = value["params"]["arguments"]["question"]
                                    .as_str()
                                    .unwrap_or_default();
                                if question == "explode" {
                                    json!({
                                        "jsonrpc": "2.0",
                                        "id": id,
                                        "error": {
                                            "code": -32000,
                                            "message": "tool blew up",
                                            "data": {"error_type": "execution_failed"}
                                        }
                                    })
                                } else {
                                    json!({
                                        "jsonrpc": "2.0",
                                        "id": id,
                                        "result": {"content": format!("ran {name}"), "is_done": true}
                                    })
                                }
                            }
                            _ => json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": {"code": -32601, "message": "method not found"}
                            }),
                        };
                        if ws.send(Message::Text(response.to_string())).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }),
    };
    server
}

/// A running, healthy WebSocket service entry pointing at `url`.
pub fn running_ws_service(id: &str, url: &str) -> ServiceConfig {
    ServiceConfig {
        service_id: ToolId::new(id),
        display_name: id.to_string(),
        description: String::new(),
        version: "1.0.0".to_string(),
        service_type: ServiceType::Builtin,
        install_method: InstallMethod::None,
        host: "127.0.0.1".to_string(),
        port: None,
        endpoint: None,
        transport: Transport::Websocket,
        working_directory: None,
        entry_point: None,
        environment: HashMap::new(),
        source_url: None,
        container_image: None,
        capabilities: vec![],
        policy: SupervisionPolicy::default(),
        metadata: ServiceMetadata::default(),
        status: ServiceStatus::Running,
        process_id: None,
        container_id: None,
        actual_endpoint: Some(url.to_string()),
        health: ServiceHealth {
            is_healthy: true,
            ..ServiceHealth::default()
        },
    }
}

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Tool-Server Sessions
//!
//! One [`McpSession`] is an initialized JSON-RPC channel to one running tool
//! server, over WebSocket (primary) or HTTP POST (secondary).
//!
//! WebSocket responses are correlated by request id through a pending map of
//! oneshot channels, so out-of-order responses are handled; the protocol
//! permits them. A background reader task owns the receive half and fails
//! all in-flight requests when the connection drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::domain::identity::ToolId;
use crate::domain::service::Transport;
use crate::infrastructure::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// MCP protocol version advertised in the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PING_TIMEOUT: Duration = Duration::from_secs(5);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>>;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error {}: {}", .0.code, .0.message)]
    Server(JsonRpcError),
}

impl SessionError {
    /// Connection-level failures that justify a retry on a fresh session.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Closed | Self::Transport(_))
    }
}

enum SessionTransport {
    Websocket { sink: Mutex<WsSink> },
    Http { client: reqwest::Client, base_url: String },
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Websocket { .. } => f.debug_struct("Websocket").finish_non_exhaustive(),
            Self::Http { base_url, .. } => {
                f.debug_struct("Http").field("base_url", base_url).finish_non_exhaustive()
            }
        }
    }
}

/// Point-in-time view of a session, for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub service_id: ToolId,
    pub is_initialized: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub last_error: Option<String>,
}

/// An initialized JSON-RPC session to one tool server.
#[derive(Debug)]
pub struct McpSession {
    pub session_id: Uuid,
    pub service_id: ToolId,
    transport: SessionTransport,
    pending: PendingMap,
    reader: Option<JoinHandle<()>>,
    closed: Arc<AtomicBool>,
    initialized: AtomicBool,
    created_at: DateTime<Utc>,
    last_activity: parking_lot::Mutex<Option<DateTime<Utc>>>,
    last_error: parking_lot::Mutex<Option<String>>,
    request_count: AtomicU64,
    server_info: parking_lot::Mutex<Option<Value>>,
}

impl McpSession {
    /// Open the transport-level connection. The protocol handshake is a
    /// separate step ([`Self::initialize`]).
    pub async fn connect(
        service_id: ToolId,
        endpoint: &str,
        transport: Transport,
    ) -> Result<Self, SessionError> {
        let session_id = Uuid::new_v4();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let (transport, reader) = match transport {
            Transport::Websocket => {
                let (stream, _response) = connect_async(endpoint)
                    .await
                    .map_err(|e| SessionError::Connect(e.to_string()))?;
                let (sink, source) = stream.split();
                let reader = tokio::spawn(Self::read_loop(
                    service_id.clone(),
                    source,
                    pending.clone(),
                    closed.clone(),
                ));
                (
                    SessionTransport::Websocket {
                        sink: Mutex::new(sink),
                    },
                    Some(reader),
                )
            }
            Transport::Http => {
                let client = reqwest::Client::builder()
                    .build()
                    .map_err(|e| SessionError::Connect(e.to_string()))?;
                // Connectivity check only; servers are free to 404 here.
                client
                    .get(format!("{}/health", endpoint.trim_end_matches('/')))
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await
                    .map_err(|e| SessionError::Connect(e.to_string()))?;
                (
                    SessionTransport::Http {
                        client,
                        base_url: endpoint.trim_end_matches('/').to_string(),
                    },
                    None,
                )
            }
        };

        debug!(service = %service_id, %session_id, "session connected");

        Ok(Self {
            session_id,
            service_id,
            transport,
            pending,
            reader,
            closed,
            initialized: AtomicBool::new(false),
            created_at: Utc::now(),
            last_activity: parking_lot::Mutex::new(None),
            last_error: parking_lot::Mutex::new(None),
            request_count: AtomicU64::new(0),
            server_info: parking_lot::Mutex::new(None),
        })
    }

    async fn read_loop(
        service_id: ToolId,
        mut source: futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        pending: PendingMap,
        closed: Arc<AtomicBool>,
    ) {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(raw)) => {
                    match serde_json::from_str::<JsonRpcResponse>(&raw) {
                        Ok(response) => {
                            if let Some(id) = response.id_as_string() {
                                let sender = pending.lock().await.remove(&id);
                                match sender {
                                    Some(tx) => {
                                        let _ = tx.send(response);
                                    }
                                    None => trace!(
                                        service = %service_id,
                                        id = %id,
                                        "response for unknown request id, dropping"
                                    ),
                                }
                            } else {
                                // Server-initiated notification; nothing routes it.
                                trace!(service = %service_id, "ignoring server notification");
                            }
                        }
                        Err(e) => {
                            warn!(service = %service_id, error = %e, "unparsable frame from server");
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(service = %service_id, error = %e, "websocket read error");
                    break;
                }
            }
        }
        closed.store(true, Ordering::SeqCst);
        // Fail everything still in flight: dropping the senders wakes the
        // waiting callers with a closed-channel error.
        pending.lock().await.clear();
    }

    /// Perform the MCP initialize exchange and send the `initialized`
    /// notification. Idempotent.
    pub async fn initialize(&self) -> Result<Value, SessionError> {
        if self.initialized.load(Ordering::SeqCst) {
            if let Some(info) = self.server_info.lock().clone() {
                return Ok(info);
            }
        }

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": "aegis-toolhost",
                "version": env!("CARGO_PKG_VERSION"),
                "host": host,
            },
            "capabilities": {
                "tools": true,
                "resources": true,
                "prompts": true,
            }
        });

        let response = self
            .send_request("initialize", Some(params), Duration::from_secs(15))
            .await?;

        let info = response
            .result
            .ok_or_else(|| SessionError::Protocol("initialize response had no result".into()))?;

        self.send_notification("notifications/initialized", None)
            .await?;

        *self.server_info.lock() = Some(info.clone());
        self.initialized.store(true, Ordering::SeqCst);
        debug!(service = %self.service_id, session = %self.session_id, "session initialized");
        Ok(info)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Liveness check against the server.
    pub async fn ping(&self) -> Result<bool, SessionError> {
        match self.send_request("ping", None, PING_TIMEOUT).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_transport_failure() => Err(e),
            Err(_) => Ok(false),
        }
    }

    /// Fetch the server's own tool list.
    pub async fn list_tools(&self) -> Result<Vec<Value>, SessionError> {
        let response = self
            .send_request("tools/list", None, Duration::from_secs(15))
            .await?;
        let tools = response
            .result
            .and_then(|r| r.get("tools").cloned())
            .and_then(|t| t.as_array().cloned())
            .unwrap_or_default();
        Ok(tools)
    }

    /// Invoke one tool capability. Server-declared errors come back as
    /// [`SessionError::Server`] so the router can classify them.
    pub async fn call_tool(
        &self,
        action: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        let params = json!({
            "name": action,
            "arguments": arguments,
        });
        let response = self.send_request("tools/call", Some(params), timeout).await?;
        if let Some(error) = response.error {
            return Err(SessionError::Server(error));
        }
        response
            .result
            .ok_or_else(|| SessionError::Protocol("tools/call response had no result".into()))
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.request_count.fetch_add(1, Ordering::Relaxed);
        *self.last_activity.lock() = Some(Utc::now());

        let result = match &self.transport {
            SessionTransport::Websocket { sink } => {
                let id = Uuid::new_v4().to_string();
                let request = JsonRpcRequest::with_id(method, params, id.clone());
                let raw = serde_json::to_string(&request)
                    .map_err(|e| SessionError::Protocol(e.to_string()))?;

                let (tx, rx) = oneshot::channel();
                self.pending.lock().await.insert(id.clone(), tx);

                let sent = {
                    let mut sink = sink.lock().await;
                    sink.send(Message::Text(raw)).await
                };
                if let Err(e) = sent {
                    self.pending.lock().await.remove(&id);
                    return self.record_error(SessionError::Transport(e.to_string()));
                }

                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(response)) => Ok(response),
                    // Sender dropped: the read loop died with the connection.
                    Ok(Err(_)) => Err(SessionError::Closed),
                    Err(_) => {
                        self.pending.lock().await.remove(&id);
                        Err(SessionError::Timeout(timeout))
                    }
                }
            }
            SessionTransport::Http { client, base_url } => {
                let request = JsonRpcRequest::with_id(method, params, Uuid::new_v4().to_string());
                let sent = client
                    .post(format!("{base_url}/rpc"))
                    .json(&request)
                    .timeout(timeout)
                    .send()
                    .await;
                match sent {
                    Ok(response) => response
                        .json::<JsonRpcResponse>()
                        .await
                        .map_err(|e| SessionError::Protocol(e.to_string())),
                    Err(e) if e.is_timeout() => Err(SessionError::Timeout(timeout)),
                    Err(e) => Err(SessionError::Transport(e.to_string())),
                }
            }
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => self.record_error(e),
        }
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), SessionError> {
        let note = JsonRpcRequest::notification(method, params);
        match &self.transport {
            SessionTransport::Websocket { sink } => {
                let raw =
                    serde_json::to_string(&note).map_err(|e| SessionError::Protocol(e.to_string()))?;
                sink.lock()
                    .await
                    .send(Message::Text(raw))
                    .await
                    .map_err(|e| SessionError::Transport(e.to_string()))
            }
            SessionTransport::Http { client, base_url } => {
                client
                    .post(format!("{base_url}/rpc"))
                    .json(&note)
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await
                    .map_err(|e| SessionError::Transport(e.to_string()))?;
                Ok(())
            }
        }
    }

    fn record_error<T>(&self, error: SessionError) -> Result<T, SessionError> {
        *self.last_error.lock() = Some(error.to_string());
        Err(error)
    }

    /// Close the session. Safe to call more than once.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let SessionTransport::Websocket { sink } = &self.transport {
            let _ = sink.lock().await.send(Message::Close(None)).await;
        }
        if let Some(reader) = &self.reader {
            reader.abort();
        }
        self.pending.lock().await.clear();
        debug!(service = %self.service_id, session = %self.session_id, "session closed");
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id,
            service_id: self.service_id.clone(),
            is_initialized: self.is_initialized(),
            created_at: self.created_at,
            last_activity_at: *self.last_activity.lock(),
            request_count: self.request_count.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Probe a WebSocket endpoint: open, upgrade, close. Success means the
/// upgrade completed within the timeout.
pub async fn probe_websocket(endpoint: &str, timeout: Duration) -> Result<(), SessionError> {
    let connect = connect_async(endpoint);
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok((mut stream, _))) => {
            let _ = stream.close(None).await;
            Ok(())
        }
        Ok(Err(e)) => Err(SessionError::Connect(e.to_string())),
        Err(_) => Err(SessionError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_session_initialize_and_call() {
        let mut server = mockito::Server::new_async().await;

        let health = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        let rpc = server
            .mock("POST", "/rpc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","result":{"serverInfo":{"name":"fake"}},"id":"1"}"#)
            .expect_at_least(2)
            .create_async()
            .await;

        let session = McpSession::connect(
            ToolId::new("deepsearch"),
            &server.url(),
            Transport::Http,
        )
        .await
        .unwrap();

        let info = session.initialize().await.unwrap();
        assert!(session.is_initialized());
        assert_eq!(info["serverInfo"]["name"], "fake");

        let result = session
            .call_tool("research", serde_json::json!({"question": "q"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.get("serverInfo").is_some());

        health.assert_async().await;
        rpc.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_session_surfaces_server_error() {
        let mut server = mockito::Server::new_async().await;
        let _health = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        let _rpc = server
            .mock("POST", "/rpc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"bad params"},"id":"1"}"#,
            )
            .create_async()
            .await;

        let session =
            McpSession::connect(ToolId::new("deepsearch"), &server.url(), Transport::Http)
                .await
                .unwrap();

        let err = session
            .call_tool("research", serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            SessionError::Server(e) => assert_eq!(e.code, -32602),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_and_tools_list() {
        let mut server = mockito::Server::new_async().await;
        let _health = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        let _rpc = server
            .mock("POST", "/rpc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"jsonrpc":"2.0","result":{"tools":[{"name":"research"}]},"id":"1"}"#,
            )
            .expect_at_least(2)
            .create_async()
            .await;

        let session =
            McpSession::connect(ToolId::new("deepsearch"), &server.url(), Transport::Http)
                .await
                .unwrap();

        assert!(session.ping().await.unwrap());
        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "research");

        let info = session.info();
        assert_eq!(info.request_count, 2);
        assert!(info.last_activity_at.is_some());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        // Nothing listens on this port.
        let err = McpSession::connect(
            ToolId::new("deepsearch"),
            "http://127.0.0.1:1",
            Transport::Http,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::Connect(_)));
    }
}

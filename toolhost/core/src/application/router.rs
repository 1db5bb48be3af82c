// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Tool Router
//!
//! The single entry point for dispatching capability calls:
//! validate against the registry, resolve the owning running service,
//! acquire a pooled session, issue `tools/call`, classify the outcome.
//! Validation failures never touch the network, and a known-down service is
//! refused immediately rather than retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::config::ToolhostConfig;
use crate::domain::events::CatalogEvent;
use crate::domain::identity::{IdentityRegistry, ToolId};
use crate::domain::invocation::{
    classify_server_error, CallError, CallOutcome, ToolCall, ToolExecutor,
};
use crate::domain::service::{ServiceConfig, ServiceStatus};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::pool::{PoolStats, SessionConnector, SessionPool};
use crate::infrastructure::session::{McpSession, SessionError};

/// Router tuning knobs, derived from the toolhost config.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_pool_size: usize,
    pub call_timeout: Duration,
    pub max_call_timeout: Duration,
    pub acquire_timeout: Duration,
    pub max_idle: Duration,
}

impl From<&ToolhostConfig> for RouterConfig {
    fn from(config: &ToolhostConfig) -> Self {
        Self {
            max_pool_size: config.max_pool_size,
            call_timeout: Duration::from_secs(config.call_timeout_seconds),
            max_call_timeout: Duration::from_secs(config.max_call_timeout_seconds),
            acquire_timeout: Duration::from_secs(30),
            max_idle: Duration::from_secs(config.max_idle_seconds),
        }
    }
}

/// Connector that resolves the service's endpoint at connect time, so a
/// pool survives endpoint changes across restarts.
struct CatalogConnector {
    service_id: ToolId,
    services: Arc<RwLock<HashMap<ToolId, ServiceConfig>>>,
}

#[async_trait::async_trait]
impl SessionConnector for CatalogConnector {
    async fn connect(&self) -> Result<McpSession, SessionError> {
        let (endpoint, transport) = {
            let services = self.services.read().await;
            let config = services
                .get(&self.service_id)
                .ok_or_else(|| SessionError::Connect("service not registered".to_string()))?;
            if config.status != ServiceStatus::Running {
                return Err(SessionError::Connect(format!(
                    "service is {}",
                    config.status
                )));
            }
            let endpoint = config
                .effective_endpoint()
                .ok_or_else(|| SessionError::Connect("service has no endpoint".to_string()))?
                .to_string();
            (endpoint, config.transport)
        };
        let session = McpSession::connect(self.service_id.clone(), &endpoint, transport).await?;
        session.initialize().await?;
        Ok(session)
    }
}

/// Routes validated calls to pooled sessions of the owning service.
pub struct ToolRouter {
    registry: Arc<IdentityRegistry>,
    services: Arc<RwLock<HashMap<ToolId, ServiceConfig>>>,
    pools: Arc<DashMap<ToolId, Arc<SessionPool>>>,
    config: RouterConfig,
}

impl ToolRouter {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        services: Arc<RwLock<HashMap<ToolId, ServiceConfig>>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            services,
            pools: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn pools_handle(&self) -> Arc<DashMap<ToolId, Arc<SessionPool>>> {
        self.pools.clone()
    }

    fn pool_for(&self, service_id: &ToolId) -> Arc<SessionPool> {
        self.pools
            .entry(service_id.clone())
            .or_insert_with(|| {
                Arc::new(SessionPool::new(
                    service_id.clone(),
                    Arc::new(CatalogConnector {
                        service_id: service_id.clone(),
                        services: self.services.clone(),
                    }),
                    self.config.max_pool_size,
                    self.config.max_idle,
                    self.config.acquire_timeout,
                ))
            })
            .clone()
    }

    /// Execute a call with caller-driven cancellation. On cancellation the
    /// session is closed rather than reused; a connection with an in-flight
    /// request cannot be trusted for the next caller.
    pub async fn call_with_cancel(
        &self,
        call: ToolCall,
        cancel: CancellationToken,
    ) -> Result<CallOutcome, CallError> {
        let started = std::time::Instant::now();
        let result = self.call_inner(&call, &cancel).await;

        let outcome_label = match &result {
            Ok(_) => "ok",
            Err(CallError::InvalidCall { .. })
            | Err(CallError::UnknownTool { .. })
            | Err(CallError::UnknownAction { .. }) => "invalid",
            Err(CallError::ServiceUnavailable { .. }) => "unavailable",
            Err(CallError::TransportError { .. }) => "transport",
            Err(CallError::Timeout { .. }) => "timeout",
            Err(CallError::ToolError { .. }) => "tool_error",
            Err(CallError::Cancelled { .. }) => "cancelled",
            Err(CallError::Internal { .. }) => "internal",
        };
        metrics::counter!(
            "toolhost_calls_total",
            "tool" => call.tool.clone(),
            "outcome" => outcome_label
        )
        .increment(1);
        metrics::histogram!("toolhost_call_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        result
    }

    async fn call_inner(
        &self,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome, CallError> {
        // 1. Validation. Failures return without any network activity.
        let validated = self
            .registry
            .validate_call(&call.tool, &call.action, &call.parameters)
            .map_err(CallError::from)?;
        let tool = validated.tool.clone();

        // 2. Resolve a running, healthy service. No retries against a
        // known-down service.
        {
            let services = self.services.read().await;
            let config = services.get(&tool).ok_or_else(|| CallError::ServiceUnavailable {
                tool: tool.to_string(),
                reason: "no service is registered for this tool".to_string(),
            })?;
            if !config.is_callable() {
                return Err(CallError::ServiceUnavailable {
                    tool: tool.to_string(),
                    reason: format!(
                        "service is {} (healthy: {}), retry once it recovers",
                        config.status, config.health.is_healthy
                    ),
                });
            }
        }

        let timeout = Duration::from_secs(
            call.timeout_seconds
                .unwrap_or(self.config.call_timeout.as_secs())
                .min(self.config.max_call_timeout.as_secs()),
        );

        // 3. Acquire a pooled session.
        let pool = self.pool_for(&tool);
        let conn = pool.acquire().await.map_err(|e| CallError::ServiceUnavailable {
            tool: tool.to_string(),
            reason: e.to_string(),
        })?;

        // 4./5. Dispatch, with one local retry on transport-level failure.
        let started = std::time::Instant::now();
        match self
            .dispatch(&pool, conn, &tool, &validated.action, &validated.parameters, timeout, cancel)
            .await
        {
            Ok(result) => Ok(CallOutcome {
                tool: tool.clone(),
                action: validated.action,
                result,
                duration_ms: started.elapsed().as_millis() as u64,
                completed_at: chrono::Utc::now(),
            }),
            Err(DispatchError::Retryable(first_error)) => {
                debug!(tool = %tool, error = %first_error, "transport failure, retrying on a fresh session");
                let conn = pool.acquire().await.map_err(|e| CallError::ServiceUnavailable {
                    tool: tool.to_string(),
                    reason: e.to_string(),
                })?;
                match self
                    .dispatch(&pool, conn, &tool, &validated.action, &validated.parameters, timeout, cancel)
                    .await
                {
                    Ok(result) => Ok(CallOutcome {
                        tool: tool.clone(),
                        action: validated.action,
                        result,
                        duration_ms: started.elapsed().as_millis() as u64,
                        completed_at: chrono::Utc::now(),
                    }),
                    Err(DispatchError::Retryable(second_error))
                    | Err(DispatchError::Fatal(CallError::TransportError {
                        message: second_error,
                        ..
                    })) => Err(CallError::TransportError {
                        tool: tool.to_string(),
                        message: second_error,
                    }),
                    Err(DispatchError::Fatal(e)) => Err(e),
                }
            }
            Err(DispatchError::Fatal(e)) => Err(e),
        }
        .map(|outcome| {
            self.record_outcome(&tool, outcome.duration_ms);
            outcome
        })
    }

    async fn dispatch(
        &self,
        pool: &Arc<SessionPool>,
        conn: crate::infrastructure::pool::PooledSession,
        tool: &ToolId,
        action: &str,
        parameters: &serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, DispatchError> {
        // Clone the session handle so the in-flight future does not borrow
        // the pooled connection the branches need to move.
        let session = conn.session.clone();
        let call_future = session.call_tool(action, parameters.clone(), timeout);
        tokio::select! {
            _ = cancel.cancelled() => {
                // The session has an abandoned in-flight request; close it.
                info!(tool = %tool, "call cancelled, closing its session");
                pool.discard(conn).await;
                Err(DispatchError::Fatal(CallError::Cancelled {
                    tool: tool.to_string(),
                }))
            }
            result = call_future => match result {
                Ok(value) => {
                    pool.release(conn).await;
                    Ok(value)
                }
                Err(SessionError::Server(server_error)) => {
                    pool.release(conn).await;
                    Err(DispatchError::Fatal(CallError::ToolError {
                        tool: tool.to_string(),
                        kind: classify_server_error(server_error.code, server_error.data.as_ref()),
                        message: server_error.message,
                        data: server_error.data,
                    }))
                }
                Err(SessionError::Timeout(_)) => {
                    // An in-flight request may still complete server-side;
                    // the session cannot be reused.
                    pool.discard(conn).await;
                    Err(DispatchError::Fatal(CallError::Timeout {
                        tool: tool.to_string(),
                        timeout_seconds: timeout.as_secs(),
                    }))
                }
                Err(e) if e.is_transport_failure() => {
                    pool.discard(conn).await;
                    Err(DispatchError::Retryable(e.to_string()))
                }
                Err(e) => {
                    pool.discard(conn).await;
                    Err(DispatchError::Fatal(CallError::TransportError {
                        tool: tool.to_string(),
                        message: e.to_string(),
                    }))
                }
            }
        }
    }

    fn record_outcome(&self, tool: &ToolId, duration_ms: u64) {
        let services = self.services.clone();
        let tool = tool.clone();
        tokio::spawn(async move {
            let mut services = services.write().await;
            if let Some(config) = services.get_mut(&tool) {
                config.health.recent_response_time_ms = Some(duration_ms);
            }
        });
    }

    /// Tear down a service's pool so new calls re-establish sessions.
    pub async fn invalidate_service(&self, service_id: &ToolId) {
        if let Some((_, pool)) = self.pools.remove(service_id) {
            info!(service = %service_id, "closing session pool");
            pool.close_all().await;
        }
    }

    /// React to catalog changes: when a service leaves `running`, its
    /// sessions are closed and future calls block on re-establishment.
    pub fn spawn_catalog_listener(
        self: &Arc<Self>,
        bus: &EventBus,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let router = self.clone();
        let mut receiver = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = receiver.recv() => match event {
                        Ok(CatalogEvent::StatusChanged { service_id, to, .. })
                            if to != ServiceStatus::Running =>
                        {
                            router.invalidate_service(&service_id).await;
                        }
                        Ok(CatalogEvent::Unregistered { service_id, .. }) => {
                            router.invalidate_service(&service_id).await;
                        }
                        Ok(_) => {}
                        Err(crate::infrastructure::event_bus::EventBusError::Lagged(n)) => {
                            warn!(lagged = n, "catalog listener lagged, invalidating all pools");
                            router.close_all_sessions().await;
                        }
                        Err(_) => break,
                    }
                }
            }
        })
    }

    /// Close every pooled session. Shutdown path.
    pub async fn close_all_sessions(&self) {
        let ids: Vec<ToolId> = self.pools.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.invalidate_service(&id).await;
        }
    }

    pub async fn pool_statistics(&self) -> Vec<PoolStats> {
        let pools: Vec<Arc<SessionPool>> = self.pools.iter().map(|e| e.value().clone()).collect();
        let mut stats = Vec::with_capacity(pools.len());
        for pool in pools {
            stats.push(pool.stats().await);
        }
        stats
    }
}

enum DispatchError {
    /// Transport-level; one local retry against a fresh session is allowed.
    Retryable(String),
    Fatal(CallError),
}

#[async_trait::async_trait]
impl ToolExecutor for ToolRouter {
    async fn call(&self, call: ToolCall) -> Result<CallOutcome, CallError> {
        self.call_with_cancel(call, CancellationToken::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::RegistryConfig;
    use crate::domain::service::{
        InstallMethod, ServiceHealth, ServiceMetadata, ServiceType, SupervisionPolicy, Transport,
    };
    use serde_json::json;

    fn service_config(endpoint: &str, status: ServiceStatus, healthy: bool) -> ServiceConfig {
        ServiceConfig {
            service_id: ToolId::new("deepsearch"),
            display_name: "DeepSearch".to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            service_type: ServiceType::Builtin,
            install_method: InstallMethod::None,
            host: "127.0.0.1".to_string(),
            port: None,
            endpoint: None,
            transport: Transport::Http,
            working_directory: None,
            entry_point: None,
            environment: HashMap::new(),
            source_url: None,
            container_image: None,
            capabilities: vec![],
            policy: SupervisionPolicy::default(),
            metadata: ServiceMetadata::default(),
            status,
            process_id: None,
            container_id: None,
            actual_endpoint: Some(endpoint.to_string()),
            health: ServiceHealth {
                is_healthy: healthy,
                ..ServiceHealth::default()
            },
        }
    }

    async fn router_with(
        config: ServiceConfig,
    ) -> (Arc<ToolRouter>, Arc<RwLock<HashMap<ToolId, ServiceConfig>>>) {
        let registry = Arc::new(
            IdentityRegistry::from_config(&RegistryConfig::builtin_defaults()).unwrap(),
        );
        let services = Arc::new(RwLock::new(HashMap::from([(
            config.service_id.clone(),
            config,
        )])));
        let router = Arc::new(ToolRouter::new(
            registry,
            services.clone(),
            RouterConfig {
                max_pool_size: 2,
                call_timeout: Duration::from_secs(5),
                max_call_timeout: Duration::from_secs(10),
                acquire_timeout: Duration::from_millis(500),
                max_idle: Duration::from_secs(600),
            },
        ));
        (router, services)
    }

    fn call(tool: &str, action: &str, params: serde_json::Value) -> ToolCall {
        ToolCall {
            tool: tool.to_string(),
            action: action.to_string(),
            parameters: params,
            timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_invalid_call_fails_without_network() {
        // Endpoint points nowhere; validation must fail first.
        let (router, _) =
            router_with(service_config("http://127.0.0.1:1", ServiceStatus::Running, true)).await;

        let err = router
            .call(call("deepsearch", "research", json!({})))
            .await
            .unwrap_err();
        match err {
            CallError::InvalidCall { errors } => {
                assert!(errors.iter().any(|e| e.contains("question")));
            }
            other => panic!("expected InvalidCall, got {other:?}"),
        }

        let err = router
            .call(call("no_such_tool", "x", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn test_down_service_is_unavailable_immediately() {
        let (router, _) =
            router_with(service_config("http://127.0.0.1:1", ServiceStatus::Stopped, false)).await;
        let err = router
            .call(call("deepsearch", "research", json!({"question": "q"})))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_successful_dispatch_over_http() {
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
            .with_body(r#"{"jsonrpc":"2.0","result":{"content":"42"},"id":"1"}"#)
            .expect_at_least(3)
            .create_async()
            .await;

        let (router, _) =
            router_with(service_config(&server.url(), ServiceStatus::Running, true)).await;

        let outcome = router
            .call(call("DeepSearch-MCP", "search", json!({"question": "meaning of life"})))
            .await
            .unwrap();
        assert_eq!(outcome.tool, ToolId::new("deepsearch"));
        assert_eq!(outcome.action, "research");
        assert_eq!(outcome.result["content"], "42");
    }

    #[tokio::test]
    async fn test_server_error_is_classified_tool_error() {
        let mut server = mockito::Server::new_async().await;
        let _health = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;
        // initialize succeeds, tools/call returns a structured error.
        let _init = server
            .mock("POST", "/rpc")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"method":"initialize"}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","result":{"serverInfo":{}},"id":"1"}"#)
            .create_async()
            .await;
        let _note = server
            .mock("POST", "/rpc")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"method":"notifications/initialized"}"#.to_string(),
            ))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let _call = server
            .mock("POST", "/rpc")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"method":"tools/call"}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"bad params","data":{"error_type":"invalid_params"}},"id":"1"}"#,
            )
            .create_async()
            .await;

        let (router, _) =
            router_with(service_config(&server.url(), ServiceStatus::Running, true)).await;

        let err = router
            .call(call("deepsearch", "research", json!({"question": "q"})))
            .await
            .unwrap_err();
        match err {
            CallError::ToolError { kind, .. } => {
                assert_eq!(kind, crate::domain::invocation::ToolErrorKind::InvalidParams);
            }
            other => panic!("expected ToolError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unhealthy_service_rejected_before_pooling() {
        let (router, _) =
            router_with(service_config("http://127.0.0.1:1", ServiceStatus::Running, false)).await;
        let err = router
            .call(call("deepsearch", "research", json!({"question": "q"})))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::ServiceUnavailable { .. }));
        // No pool was ever created for the down service.
        assert!(router.pool_statistics().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_returns_cancelled_and_discards_session() {
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
            .with_body(r#"{"jsonrpc":"2.0","result":{},"id":"1"}"#)
            .create_async()
            .await;

        let (router, _) =
            router_with(service_config(&server.url(), ServiceStatus::Running, true)).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = router
            .call_with_cancel(
                call("deepsearch", "research", json!({"question": "q"})),
                cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Cancelled { .. }));

        // The cancelled session was discarded, not parked idle.
        let stats = router.pool_statistics().await;
        assert!(stats.iter().all(|s| s.idle == 0));
    }
}

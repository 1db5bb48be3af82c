// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// End-to-end router tests against an in-process fake tool server:
// alias routing, validation short-circuits, pool limits under concurrent
// load, transport retry, and server-declared errors.

mod support;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;

use aegis_toolhost_core::application::router::{RouterConfig, ToolRouter};
use aegis_toolhost_core::domain::identity::{IdentityRegistry, RegistryConfig, ToolId};
use aegis_toolhost_core::domain::invocation::{CallError, ToolCall, ToolErrorKind, ToolExecutor};
use aegis_toolhost_core::domain::service::ServiceConfig;

use support::{running_ws_service, spawn_ws_server};

fn router_config(max_pool_size: usize) -> RouterConfig {
    RouterConfig {
        max_pool_size,
        call_timeout: Duration::from_secs(10),
        max_call_timeout: Duration::from_secs(20),
        acquire_timeout: Duration::from_secs(10),
        max_idle: Duration::from_secs(600),
    }
}

fn build_router(
    config: ServiceConfig,
    max_pool_size: usize,
) -> (Arc<ToolRouter>, Arc<RwLock<HashMap<ToolId, ServiceConfig>>>) {
    let registry =
        Arc::new(IdentityRegistry::from_config(&RegistryConfig::builtin_defaults()).unwrap());
    let services = Arc::new(RwLock::new(HashMap::from([(
        config.service_id.clone(),
        config,
    )])));
    let router = Arc::new(ToolRouter::new(
        registry,
        services.clone(),
        router_config(max_pool_size),
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
async fn test_alias_call_routes_to_canonical_action() {
    let server = spawn_ws_server(Duration::from_millis(10), 0).await;
    let (router, _) = build_router(running_ws_service("microsandbox", &server.url), 2);

    let outcome = router
        .call(call(
            "MicroSandbox-MCP",
            "execute",
            json!({"code": "print(1)"}),
        ))
        .await
        .unwrap();

    // Both names are canonical at the routing boundary.
    assert_eq!(outcome.tool, ToolId::new("microsandbox"));
    assert_eq!(outcome.action, "microsandbox_execute");
    assert_eq!(outcome.result["is_done"], json!(true));
    assert_eq!(
        server.last_call_name.lock().unwrap().as_deref(),
        Some("microsandbox_execute")
    );
}

#[tokio::test]
async fn test_missing_required_parameter_never_touches_network() {
    let server = spawn_ws_server(Duration::from_millis(10), 0).await;
    let (router, _) = build_router(running_ws_service("microsandbox", &server.url), 2);

    let err = router
        .call(call("microsandbox", "microsandbox_execute", json!({})))
        .await
        .unwrap_err();

    match err {
        CallError::InvalidCall { errors } => {
            assert!(errors.iter().any(|e| e.contains("code")), "{errors:?}");
        }
        other => panic!("expected InvalidCall, got {other:?}"),
    }
    assert_eq!(server.connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_calls_honour_pool_limit() {
    let max_pool = 3;
    let extra = 4;
    let server = spawn_ws_server(Duration::from_millis(150), 0).await;
    let (router, _) = build_router(running_ws_service("deepsearch", &server.url), max_pool);

    let mut handles = Vec::new();
    for i in 0..(max_pool + extra) {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            router
                .call(call(
                    "deepsearch",
                    "research",
                    json!({"question": format!("q{i}")}),
                ))
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().expect("no call should be rejected");
    }

    assert_eq!(server.calls.load(Ordering::SeqCst), max_pool + extra);
    assert!(
        server.max_in_flight.load(Ordering::SeqCst) <= max_pool,
        "in-flight {} exceeded pool size {}",
        server.max_in_flight.load(Ordering::SeqCst),
        max_pool
    );
}

#[tokio::test]
async fn test_transport_failure_is_retried_once_on_fresh_session() {
    // First tools/call drops the connection without a response.
    let server = spawn_ws_server(Duration::from_millis(10), 1).await;
    let (router, _) = build_router(running_ws_service("deepsearch", &server.url), 2);

    let outcome = router
        .call(call("deepsearch", "research", json!({"question": "q"})))
        .await
        .unwrap();
    assert_eq!(outcome.result["is_done"], json!(true));
    // Two sessions: the dropped one and the retry.
    assert!(server.connections.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_server_error_preserves_classification() {
    let server = spawn_ws_server(Duration::from_millis(10), 0).await;
    let (router, _) = build_router(running_ws_service("deepsearch", &server.url), 2);

    // The fake server fails any research whose question is "explode".
    let err = router
        .call(call("deepsearch", "research", json!({"question": "explode"})))
        .await
        .unwrap_err();

    match err {
        CallError::ToolError { kind, message, .. } => {
            assert_eq!(kind, ToolErrorKind::ExecutionFailed);
            assert_eq!(message, "tool blew up");
        }
        other => panic!("expected ToolError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_sessions_are_pooled_across_sequential_calls() {
    let server = spawn_ws_server(Duration::from_millis(5), 0).await;
    let (router, _) = build_router(running_ws_service("deepsearch", &server.url), 2);

    for i in 0..5 {
        router
            .call(call(
                "deepsearch",
                "research",
                json!({"question": format!("q{i}")}),
            ))
            .await
            .unwrap();
    }
    // Sequential calls reuse one pooled session.
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert_eq!(server.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_service_marked_down_is_refused_without_dialing() {
    let server = spawn_ws_server(Duration::from_millis(5), 0).await;
    let mut config = running_ws_service("deepsearch", &server.url);
    config.health.is_healthy = false;
    let (router, _) = build_router(config, 2);

    let err = router
        .call(call("deepsearch", "research", json!({"question": "q"})))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::ServiceUnavailable { .. }));
    assert_eq!(server.connections.load(Ordering::SeqCst), 0);
}

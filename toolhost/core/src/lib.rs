// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # aegis-toolhost-core
//!
//! The tool-server supervision core for AEGIS. This crate owns the canonical
//! tool identity registry, the service container that discovers, installs and
//! supervises tool-server subprocesses, the JSON-RPC session router, and the
//! real-time catalog event stream consumed by LLM-facing clients.
//!
//! ## Bounded Contexts Implemented
//!
//! | Bounded Context | Key modules |
//! |---|---|
//! | **Tool Identity & Capabilities** | [`domain::identity`] |
//! | **Service Lifecycle** | [`domain::service`], [`application::container`] |
//! | **Process Supervision** | [`infrastructure::process`], [`infrastructure::container_runtime`] |
//! | **Installation & Discovery** | [`infrastructure::installer`], [`infrastructure::discovery`] |
//! | **Sessions & Routing** | [`infrastructure::session`], [`infrastructure::pool`], [`application::router`] |
//! | **Monitoring & Events** | [`application::monitor`], [`infrastructure::event_bus`] |
//!
//! ## Layer Structure
//!
//! ```text
//! presentation/   ← HTTP API + catalog event stream (axum)
//!     ↓
//! application/    ← Service container, tool router, health monitor
//!     ↓
//! domain/         ← Identity registry, service aggregate, events, call taxonomy
//!     ↓
//! infrastructure/ ← Ports, subprocesses, container runtime, installer,
//!                   discovery, JSON-RPC sessions, pools, event bus
//! ```
//!
//! ## Integration Tests
//!
//! See `toolhost/core/tests/` for integration tests covering registry
//! validation, container lifecycle against fake tool servers, and session
//! pooling under concurrent calls.

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod container_runtime;
pub mod discovery;
pub mod event_bus;
pub mod installer;
pub mod jsonrpc;
pub mod pool;
pub mod ports;
pub mod process;
pub mod session;

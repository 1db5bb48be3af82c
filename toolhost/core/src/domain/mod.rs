// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod config;
pub mod events;
pub mod identity;
pub mod invocation;
pub mod service;

// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # toolhostd
//!
//! The toolhost daemon: boots the core from environment configuration,
//! serves the HTTP/WebSocket surface, and shuts the fleet down cleanly on
//! SIGINT. Exit codes: 0 clean shutdown, 1 initialization failure, 2 fatal
//! supervisor error.

use anyhow::{Context, Result};
use tracing::{error, info};

use aegis_toolhost_core::application::toolhost::Toolhost;
use aegis_toolhost_core::domain::config::ToolhostConfig;
use aegis_toolhost_core::presentation::api;

fn init_logging() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = init_logging() {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let config = ToolhostConfig::from_env();
    info!(
        api = %config.api_addr,
        storage = %config.storage_root.display(),
        ports = %format!("{}..={}", config.port_range_start, config.port_range_end),
        "starting toolhostd"
    );

    let toolhost = match Toolhost::boot(config.clone()).await {
        Ok(toolhost) => toolhost,
        Err(e) => {
            error!(error = %e, "initialization failed");
            std::process::exit(1);
        }
    };

    let app = api::app(
        toolhost.container.clone(),
        toolhost.router.clone(),
        toolhost.monitor.clone(),
        toolhost.bus.clone(),
    );

    let listener = match tokio::net::TcpListener::bind(config.api_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.api_addr, error = %e, "failed to bind API address");
            toolhost.shutdown().await;
            std::process::exit(1);
        }
    };
    info!(addr = %config.api_addr, "API surface listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received");
        })
        .await;

    toolhost.shutdown().await;

    match serve_result {
        Ok(()) => {
            info!("toolhostd stopped cleanly");
            std::process::exit(0);
        }
        Err(e) => {
            error!(error = %e, "fatal supervisor error");
            std::process::exit(2);
        }
    }
}

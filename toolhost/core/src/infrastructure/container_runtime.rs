// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Container runtime adapter.
//
// Drives the configured runtime binary for `container_image` services:
// pull, run, stop, liveness. Pull carries the 300 second budget; everything
// else stays short.
//
// The binary is assumed to speak the docker CLI dialect: `pull`,
// `images -q`, `run -d --rm -p 127.0.0.1:<host>:<container>`, `stop`, and
// `ps -q -f id=<id>`. podman's docker-compatible CLI accepts the same flag
// set; anything else needs a shim at the configured binary path.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::identity::ToolId;

const PULL_TIMEOUT: Duration = Duration::from_secs(300);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ContainerError {
    #[error("container runtime binary '{0}' is not available")]
    RuntimeUnavailable(String),

    #[error("'{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("'{command}' timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },
}

/// Thin adapter over the container runtime binary.
#[derive(Clone)]
pub struct ContainerRuntime {
    binary: PathBuf,
}

impl ContainerRuntime {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Whether the runtime binary answers `version`.
    pub async fn is_available(&self) -> bool {
        self.run(&["version".to_string()], COMMAND_TIMEOUT).await.is_ok()
    }

    /// Pull an image. Required before first run; also recreates services
    /// from a cached image during fleet recovery.
    pub async fn pull(&self, image: &str) -> Result<(), ContainerError> {
        info!(image, "pulling container image");
        self.run(&["pull".to_string(), image.to_string()], PULL_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Whether the image exists locally.
    pub async fn image_exists(&self, image: &str) -> Result<bool, ContainerError> {
        let stdout = self
            .run(
                &["images".to_string(), "-q".to_string(), image.to_string()],
                COMMAND_TIMEOUT,
            )
            .await?;
        Ok(!stdout.trim().is_empty())
    }

    /// Run a detached container publishing the service port. Returns the
    /// container id.
    pub async fn run_detached(
        &self,
        service_id: &ToolId,
        image: &str,
        host_port: u16,
        container_port: u16,
    ) -> Result<String, ContainerError> {
        let name = format!("toolhost-{service_id}");
        let stdout = self
            .run(
                &[
                    "run".to_string(),
                    "-d".to_string(),
                    "--rm".to_string(),
                    "--name".to_string(),
                    name,
                    "-p".to_string(),
                    format!("127.0.0.1:{host_port}:{container_port}"),
                    "-e".to_string(),
                    format!("PORT={container_port}"),
                    image.to_string(),
                ],
                COMMAND_TIMEOUT,
            )
            .await?;
        let container_id = stdout.trim().to_string();
        info!(service = %service_id, container = %container_id, host_port, "container started");
        Ok(container_id)
    }

    /// Stop a container, with the runtime's own grace handling.
    pub async fn stop(&self, container_id: &str) -> Result<(), ContainerError> {
        self.run(
            &["stop".to_string(), container_id.to_string()],
            COMMAND_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Whether a container id is currently running.
    pub async fn is_running(&self, container_id: &str) -> Result<bool, ContainerError> {
        let stdout = self
            .run(
                &[
                    "ps".to_string(),
                    "-q".to_string(),
                    "-f".to_string(),
                    format!("id={container_id}"),
                ],
                COMMAND_TIMEOUT,
            )
            .await?;
        Ok(!stdout.trim().is_empty())
    }

    async fn run(&self, args: &[String], timeout: Duration) -> Result<String, ContainerError> {
        let command_line = format!(
            "{} {}",
            self.binary.display(),
            args.join(" ")
        );
        debug!(command = %command_line, "invoking container runtime");

        let output = Command::new(&self.binary).args(args).output();
        let output = tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| ContainerError::CommandTimeout {
                command: command_line.clone(),
                timeout,
            })?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ContainerError::RuntimeUnavailable(self.binary.display().to_string())
                } else {
                    ContainerError::CommandFailed {
                        command: command_line.clone(),
                        stderr: e.to_string(),
                    }
                }
            })?;

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: command_line,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

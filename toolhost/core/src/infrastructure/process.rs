// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Process Supervisor
//!
//! Owns the subprocess of every running tool server. No other component may
//! signal those processes. Children are spawned into their own process group
//! so termination can sweep the whole tree, and each launch records its PID
//! in a `server.pid` file inside the service working directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::identity::ToolId;
use crate::domain::service::Transport;
use crate::infrastructure::session::probe_websocket;

/// Readiness poll cadence. Must stay under 500 ms.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(400);
/// Per-attempt budget for the transport handshake during readiness.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
/// Ceiling for exponential restart backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn '{service}': {message}")]
    SpawnFailed { service: ToolId, message: String },

    #[error("no usable entry point under {0}")]
    MissingEntryPoint(PathBuf),

    #[error("port {port} is held by another process (pid {pid}, cmdline '{cmdline}')")]
    PortConflict {
        port: u16,
        pid: u32,
        cmdline: String,
    },

    #[error("no supervised process for '{0}'")]
    NotSupervised(ToolId),

    #[error("failed to terminate '{service}': {message}")]
    TerminationFailed { service: ToolId, message: String },
}

/// Result of waiting for a freshly launched server to become reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    Ready,
    /// The child exited during the wait. Distinct from a timeout.
    Crashed(Option<i32>),
    TimedOut,
}

/// Status of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(Option<i32>),
    NotFound,
}

struct ManagedProcess {
    pid: u32,
    child: Mutex<tokio::process::Child>,
}

/// Spawns and manages the lifetime of one subprocess per running service.
pub struct ProcessSupervisor {
    processes: DashMap<ToolId, ManagedProcess>,
    grace: Duration,
}

impl ProcessSupervisor {
    /// `grace` is the termination grace window, clamped to 5..=30 seconds.
    pub fn new(grace: Duration) -> Self {
        Self {
            processes: DashMap::new(),
            grace: grace.clamp(Duration::from_secs(5), Duration::from_secs(30)),
        }
    }

    /// Derive the launch argv for a service working directory. Entry points
    /// cover the two project kinds tool servers actually ship: Python files
    /// and Node packages.
    pub fn entry_command(
        working_dir: &Path,
        entry_point: Option<&str>,
    ) -> Result<Vec<String>, ProcessError> {
        if let Some(entry) = entry_point {
            if entry == "npm start" {
                return Ok(vec!["npm".into(), "start".into()]);
            }
            if entry.ends_with(".py") {
                return Ok(vec!["python3".into(), entry.into()]);
            }
            if entry.ends_with(".js") || entry.ends_with(".mjs") {
                return Ok(vec!["node".into(), entry.into()]);
            }
        }
        if working_dir.join("main.py").exists() {
            return Ok(vec!["python3".into(), "main.py".into()]);
        }
        if working_dir.join("package.json").exists() {
            return Ok(vec!["npm".into(), "start".into()]);
        }
        Err(ProcessError::MissingEntryPoint(working_dir.to_path_buf()))
    }

    /// Spawn a service subprocess with an explicit argv. Records the PID and
    /// writes the `server.pid` runtime file.
    pub async fn launch_with_command(
        &self,
        service_id: &ToolId,
        argv: &[String],
        working_dir: &Path,
        env: &HashMap<String, String>,
        port: u16,
    ) -> Result<u32, ProcessError> {
        let (program, args) = argv.split_first().ok_or_else(|| ProcessError::SpawnFailed {
            service: service_id.clone(),
            message: "empty command".to_string(),
        })?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .current_dir(working_dir)
            .env("PORT", port.to_string())
            .env("HOST", "127.0.0.1")
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        // Detach into its own process group so signals do not reach the
        // supervisor's terminal, and group kills sweep the whole tree.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| ProcessError::SpawnFailed {
            service: service_id.clone(),
            message: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
            service: service_id.clone(),
            message: "child exited before a pid was assigned".to_string(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            let service = service_id.clone();
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(service = %service, "{line}");
                }
            });
        }

        if let Err(e) = tokio::fs::write(working_dir.join("server.pid"), pid.to_string()).await {
            warn!(service = %service_id, error = %e, "failed to write server.pid");
        }

        info!(service = %service_id, pid, port, "launched tool server process");
        self.processes.insert(
            service_id.clone(),
            ManagedProcess {
                pid,
                child: Mutex::new(child),
            },
        );
        Ok(pid)
    }

    /// Poll until the server's port is listening and its transport answers a
    /// handshake, the child crashes, or the deadline passes.
    pub async fn wait_ready(
        &self,
        service_id: &ToolId,
        port: u16,
        transport: Transport,
        deadline: Duration,
    ) -> ReadyOutcome {
        let started = tokio::time::Instant::now();
        loop {
            if let ProcessStatus::Exited(code) = self.status(service_id).await {
                return ReadyOutcome::Crashed(code);
            }

            if TcpStream::connect(("127.0.0.1", port)).await.is_ok()
                && Self::handshake(port, transport).await
            {
                return ReadyOutcome::Ready;
            }

            if started.elapsed() >= deadline {
                return ReadyOutcome::TimedOut;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn handshake(port: u16, transport: Transport) -> bool {
        match transport {
            Transport::Websocket => {
                probe_websocket(&format!("ws://127.0.0.1:{port}"), HANDSHAKE_TIMEOUT)
                    .await
                    .is_ok()
            }
            Transport::Http => {
                let client = match reqwest::Client::builder().build() {
                    Ok(c) => c,
                    Err(_) => return false,
                };
                for path in ["/health", "/ping", "/status", "/"] {
                    let url = format!("http://127.0.0.1:{port}{path}");
                    if let Ok(response) = client
                        .get(&url)
                        .timeout(HANDSHAKE_TIMEOUT)
                        .send()
                        .await
                    {
                        // Any 2xx or 3xx answer counts as alive.
                        if response.status().as_u16() < 400 {
                            return true;
                        }
                    }
                }
                false
            }
        }
    }

    /// Current status of the supervised process for a service.
    pub async fn status(&self, service_id: &ToolId) -> ProcessStatus {
        match self.processes.get(service_id) {
            Some(managed) => {
                let mut child = managed.child.lock().await;
                match child.try_wait() {
                    Ok(Some(exit)) => ProcessStatus::Exited(exit.code()),
                    Ok(None) => ProcessStatus::Running,
                    Err(_) => ProcessStatus::NotFound,
                }
            }
            None => ProcessStatus::NotFound,
        }
    }

    pub fn pid_of(&self, service_id: &ToolId) -> Option<u32> {
        self.processes.get(service_id).map(|m| m.pid)
    }

    /// Terminate a service's process tree: children first, parent last,
    /// graceful signal, then a group SIGKILL after the grace window.
    pub async fn terminate(&self, service_id: &ToolId) -> Result<(), ProcessError> {
        let (_, managed) = self
            .processes
            .remove(service_id)
            .ok_or_else(|| ProcessError::NotSupervised(service_id.clone()))?;

        let pid = managed.pid;
        for child_pid in child_pids_of(pid) {
            signal_pid(child_pid, libc::SIGTERM);
        }
        signal_pid(pid, libc::SIGTERM);

        let mut child = managed.child.into_inner();
        let graceful = tokio::time::timeout(self.grace, child.wait()).await;
        match graceful {
            Ok(Ok(exit)) => {
                info!(service = %service_id, pid, code = ?exit.code(), "process terminated");
                Ok(())
            }
            Ok(Err(e)) => Err(ProcessError::TerminationFailed {
                service: service_id.clone(),
                message: e.to_string(),
            }),
            Err(_) => {
                warn!(service = %service_id, pid, "grace expired, killing process group");
                signal_group(pid, libc::SIGKILL);
                child.wait().await.map_err(|e| ProcessError::TerminationFailed {
                    service: service_id.clone(),
                    message: e.to_string(),
                })?;
                Ok(())
            }
        }
    }

    /// Force-kill every supervised process. Shutdown escalation path.
    pub async fn kill_all(&self) {
        let services: Vec<ToolId> = self.processes.iter().map(|e| e.key().clone()).collect();
        for service_id in services {
            if let Some((_, managed)) = self.processes.remove(&service_id) {
                warn!(service = %service_id, pid = managed.pid, "force killing");
                signal_group(managed.pid, libc::SIGKILL);
                let mut child = managed.child.into_inner();
                let _ = child.wait().await;
            }
        }
    }

    pub fn supervised_count(&self) -> usize {
        self.processes.len()
    }
}

/// Terminate a process the supervisor does not own a handle for: a stale
/// instance from a previous supervisor run, found via pid file or port
/// inspection. Graceful signal first, group SIGKILL after the grace window.
pub async fn terminate_stale_pid(pid: u32, grace: Duration) {
    if !is_pid_alive(pid) {
        return;
    }
    for child_pid in child_pids_of(pid) {
        signal_pid(child_pid, libc::SIGTERM);
    }
    signal_pid(pid, libc::SIGTERM);

    let started = tokio::time::Instant::now();
    while started.elapsed() < grace {
        if !is_pid_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    warn!(pid, "stale process survived grace window, killing group");
    signal_group(pid, libc::SIGKILL);
    signal_pid(pid, libc::SIGKILL);
}

/// Exponential restart backoff: `base * 1.5^attempt`, capped.
pub fn backoff_delay(base_seconds: u64, attempt: u32) -> Duration {
    let factor = 1.5_f64.powi(attempt.min(16) as i32);
    let seconds = (base_seconds as f64 * factor).min(MAX_BACKOFF.as_secs_f64());
    Duration::from_secs_f64(seconds)
}

/// Whether a PID is alive on this host.
pub fn is_pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn signal_pid(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

fn signal_group(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

/// Direct children of a PID, via /proc. Empty on non-Linux hosts.
#[cfg(target_os = "linux")]
pub fn child_pids_of(parent: u32) -> Vec<u32> {
    let mut children = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return children;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        // Field 4 of /proc/[pid]/stat is the ppid; the comm field may hold
        // spaces, so split after the closing paren.
        if let Some(rest) = stat.rsplit_once(')').map(|(_, rest)| rest) {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.get(1).and_then(|f| f.parse::<u32>().ok()) == Some(parent) {
                children.push(pid);
            }
        }
    }
    children
}

#[cfg(not(target_os = "linux"))]
pub fn child_pids_of(_parent: u32) -> Vec<u32> {
    Vec::new()
}

/// Find the process listening on a local TCP port, with its command line.
/// Used for port-conflict resolution: a stale instance of the same service
/// may be terminated, anything else fails the launch.
#[cfg(target_os = "linux")]
pub fn find_listener(port: u16) -> Option<(u32, String)> {
    const TCP_LISTEN: &str = "0A";

    let mut inodes = Vec::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(content) = std::fs::read_to_string(table) else {
            continue;
        };
        for line in content.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let (Some(local), Some(state), Some(inode)) =
                (fields.get(1), fields.get(3), fields.get(9))
            else {
                continue;
            };
            if *state != TCP_LISTEN {
                continue;
            }
            let Some(port_hex) = local.rsplit(':').next() else {
                continue;
            };
            if u16::from_str_radix(port_hex, 16) == Ok(port) {
                inodes.push(inode.to_string());
            }
        }
    }
    if inodes.is_empty() {
        return None;
    }

    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(format!("/proc/{pid}/fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            let holds_socket = inodes
                .iter()
                .any(|inode| target.as_ref() == format!("socket:[{inode}]"));
            if holds_socket {
                let cmdline = std::fs::read_to_string(format!("/proc/{pid}/cmdline"))
                    .map(|raw| raw.replace('\0', " ").trim().to_string())
                    .unwrap_or_default();
                return Some((pid, cmdline));
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn find_listener(_port: u16) -> Option<(u32, String)> {
    None
}

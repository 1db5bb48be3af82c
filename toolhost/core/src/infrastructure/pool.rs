// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Pools
//!
//! Per-service pools of initialized [`McpSession`]s. Acquire prefers an idle
//! session, opens a new one while below capacity, and otherwise waits for a
//! release with a bounded deadline. A background sweep closes sessions idle
//! for longer than the configured maximum.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::identity::ToolId;
use crate::infrastructure::session::{McpSession, SessionError};

/// Opens one initialized session to a specific service. Implemented by the
/// router, which knows the service's current endpoint and transport.
#[async_trait::async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self) -> Result<McpSession, SessionError>;
}

/// A session checked out of a pool.
#[derive(Debug)]
pub struct PooledSession {
    pub id: Uuid,
    pub session: Arc<McpSession>,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    use_count: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("timed out waiting for a free session to '{service}' after {waited:?}")]
    AcquireTimeout { service: ToolId, waited: Duration },

    #[error("failed to open session to '{service}': {message}")]
    ConnectFailed { service: ToolId, message: String },

    #[error("pool for '{service}' is closed")]
    PoolClosed { service: ToolId },
}

struct PoolState {
    idle: Vec<PooledSession>,
    /// Sessions alive in total, checked out or idle.
    size: usize,
    closed: bool,
}

/// Pool statistics, keyed per service by the router.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub service_id: ToolId,
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub average_use_count: f64,
}

/// Pool of reusable sessions for one service.
pub struct SessionPool {
    service_id: ToolId,
    connector: Arc<dyn SessionConnector>,
    max_size: usize,
    max_idle: Duration,
    acquire_timeout: Duration,
    state: Mutex<PoolState>,
    notify: Notify,
}

impl SessionPool {
    pub fn new(
        service_id: ToolId,
        connector: Arc<dyn SessionConnector>,
        max_size: usize,
        max_idle: Duration,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            service_id,
            connector,
            max_size: max_size.max(1),
            max_idle,
            acquire_timeout,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                size: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Acquire a session: idle first, then grow, then wait.
    pub async fn acquire(&self) -> Result<PooledSession, PoolError> {
        let deadline = tokio::time::Instant::now() + self.acquire_timeout;

        loop {
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(PoolError::PoolClosed {
                        service: self.service_id.clone(),
                    });
                }

                // Prefer the most recently used idle session; drop any that
                // died while parked.
                while let Some(mut conn) = state.idle.pop() {
                    if conn.session.is_closed() {
                        state.size -= 1;
                        continue;
                    }
                    conn.last_used_at = Utc::now();
                    conn.use_count += 1;
                    return Ok(conn);
                }

                if state.size < self.max_size {
                    state.size += 1;
                    drop(state);
                    return self.open_session().await;
                }
            }

            // At capacity: wait for a release or the deadline.
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(PoolError::AcquireTimeout {
                    service: self.service_id.clone(),
                    waited: self.acquire_timeout,
                });
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Err(PoolError::AcquireTimeout {
                    service: self.service_id.clone(),
                    waited: self.acquire_timeout,
                });
            }
        }
    }

    async fn open_session(&self) -> Result<PooledSession, PoolError> {
        match self.connector.connect().await {
            Ok(session) => {
                debug!(service = %self.service_id, "opened pooled session");
                Ok(PooledSession {
                    id: Uuid::new_v4(),
                    session: Arc::new(session),
                    created_at: Utc::now(),
                    last_used_at: Utc::now(),
                    use_count: 1,
                })
            }
            Err(e) => {
                // Give the reserved slot back and wake one waiter.
                let mut state = self.state.lock().await;
                state.size -= 1;
                drop(state);
                self.notify.notify_one();
                Err(PoolError::ConnectFailed {
                    service: self.service_id.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Return a session to the idle set.
    pub async fn release(&self, mut conn: PooledSession) {
        conn.last_used_at = Utc::now();
        let mut state = self.state.lock().await;
        if state.closed || conn.session.is_closed() {
            state.size -= 1;
            drop(state);
            let session = conn.session;
            tokio::spawn(async move { session.close().await });
        } else {
            state.idle.push(conn);
            drop(state);
        }
        self.notify.notify_one();
    }

    /// Discard a session instead of returning it (transport failure,
    /// cancellation). Shrinks the pool and wakes one waiter.
    pub async fn discard(&self, conn: PooledSession) {
        {
            let mut state = self.state.lock().await;
            state.size -= 1;
        }
        self.notify.notify_one();
        let session = conn.session;
        tokio::spawn(async move { session.close().await });
        debug!(service = %self.service_id, "discarded pooled session");
    }

    /// Close idle sessions unused for longer than `max_idle`.
    pub async fn sweep_idle(&self) -> usize {
        let threshold = Utc::now()
            - chrono::Duration::from_std(self.max_idle).unwrap_or(chrono::Duration::seconds(600));
        let stale: Vec<PooledSession> = {
            let mut state = self.state.lock().await;
            let (stale, keep): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|conn| conn.last_used_at < threshold);
            state.idle = keep;
            state.size -= stale.len();
            stale
        };
        let count = stale.len();
        for conn in stale {
            info!(
                service = %self.service_id,
                session = %conn.session.session_id,
                age_seconds = (Utc::now() - conn.created_at).num_seconds(),
                "closing idle session"
            );
            conn.session.close().await;
        }
        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    /// Close every idle session and refuse further acquires.
    pub async fn close_all(&self) {
        let drained: Vec<PooledSession> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.size -= drained.len();
            drained
        };
        for conn in drained {
            conn.session.close().await;
        }
        self.notify.notify_waiters();
        debug!(service = %self.service_id, "pool closed");
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let idle = state.idle.len();
        let total = state.size;
        let use_sum: u64 = state.idle.iter().map(|c| c.use_count).sum();
        PoolStats {
            service_id: self.service_id.clone(),
            total,
            idle,
            busy: total - idle,
            average_use_count: if idle == 0 {
                0.0
            } else {
                use_sum as f64 / idle as f64
            },
        }
    }
}

/// Spawn the periodic idle sweep for a set of pools. Honours the shutdown
/// token and checks once a minute, as the cleanup cadence.
pub fn spawn_idle_sweeper(
    pools: Arc<dashmap::DashMap<ToolId, Arc<SessionPool>>>,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let pool_refs: Vec<Arc<SessionPool>> =
                        pools.iter().map(|entry| entry.value().clone()).collect();
                    for pool in pool_refs {
                        let swept = pool.sweep_idle().await;
                        if swept > 0 {
                            debug!(swept, "idle session sweep");
                        }
                    }
                }
            }
        }
        warn!("idle session sweeper stopped");
    })
}

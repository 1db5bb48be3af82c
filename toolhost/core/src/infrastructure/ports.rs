// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Port Allocator - leases TCP ports from a fixed range.
//
// Leased ports are remembered so a freshly-released port is not handed out
// again immediately (a just-killed server may still hold the socket in
// TIME_WAIT). When the whole range is exhausted, the lease memory is cleared
// and the range scanned once more before failing.

use std::collections::HashSet;
use std::net::TcpListener;

use parking_lot::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("no free port in range {start}..={end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("failed to bind ephemeral port: {0}")]
    EphemeralBind(String),
}

/// Leases TCP ports from an inclusive range. Internally serialized.
pub struct PortAllocator {
    start: u16,
    end: u16,
    leased: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            leased: Mutex::new(HashSet::new()),
        }
    }

    /// Lease a port that is verified free by a transient bind attempt.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut leased = self.leased.lock();

        for port in self.start..=self.end {
            if !leased.contains(&port) && Self::bind_check(port) {
                leased.insert(port);
                debug!(port, "allocated port from range");
                return Ok(port);
            }
        }

        // Range exhausted: forget lease history and scan once more. Ports
        // released long ago may be free again by now.
        if !leased.is_empty() {
            info!("port range exhausted, clearing lease memory and rescanning");
            leased.clear();
            for port in self.start..=self.end {
                if Self::bind_check(port) {
                    leased.insert(port);
                    debug!(port, "allocated port after lease reset");
                    return Ok(port);
                }
            }
        }

        Err(PortError::NoFreePort {
            start: self.start,
            end: self.end,
        })
    }

    /// Lease an OS-assigned ephemeral port (bind to 0, read the assignment).
    /// Only used when a caller explicitly opts out of the fixed range.
    pub fn allocate_ephemeral(&self) -> Result<u16, PortError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .map_err(|e| PortError::EphemeralBind(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| PortError::EphemeralBind(e.to_string()))?
            .port();
        info!(port, "allocated OS-assigned ephemeral port");
        Ok(port)
    }

    /// Return a port to the pool. Idempotent.
    pub fn release(&self, port: u16) {
        if self.leased.lock().remove(&port) {
            debug!(port, "released port");
        }
    }

    /// Best-effort check whether a port is currently bindable.
    pub fn is_free(&self, port: u16) -> bool {
        Self::bind_check(port)
    }

    pub fn leased_count(&self) -> usize {
        self.leased.lock().len()
    }

    fn bind_check(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

//! Process-wide connection counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Monotonic counters updated by the accept loop and connection tasks.
#[derive(Debug)]
pub struct GatewayStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    handshake_failures: AtomicU64,
    auth_failures: AtomicU64,
    closed: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    started_at: Instant,
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayStats {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// A TCP connection was admitted.
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// A TCP connection was refused by the connection limit.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// A WebSocket upgrade failed or timed out.
    pub fn record_handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// An AUTH was refused.
    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// An upgraded connection finished closing.
    pub fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame was read.
    pub fn record_frame_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame was written.
    pub fn record_frame_out(&self) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds since the counters were created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Point-in-time copy, combined with directory gauges.
    #[must_use]
    pub fn snapshot(
        &self,
        online_identities: usize,
        open_connections: usize,
        directory_failures: u64,
    ) -> StatsSnapshot {
        StatsSnapshot {
            online_identities,
            open_connections,
            accepted_total: self.accepted.load(Ordering::Relaxed),
            rejected_total: self.rejected.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            closed_total: self.closed.load(Ordering::Relaxed),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            directory_failures,
            uptime_secs: self.uptime_secs(),
        }
    }
}

/// Serializable view of gateway counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Identities with at least one local connection.
    pub online_identities: usize,
    /// Authenticated local connections.
    pub open_connections: usize,
    /// TCP connections admitted.
    pub accepted_total: u64,
    /// TCP connections refused by the limit.
    pub rejected_total: u64,
    /// Failed upgrades.
    pub handshake_failures: u64,
    /// Refused AUTHs.
    pub auth_failures: u64,
    /// Connections fully closed.
    pub closed_total: u64,
    /// Frames read.
    pub frames_in: u64,
    /// Frames written.
    pub frames_out: u64,
    /// Directory-store calls that failed.
    pub directory_failures: u64,
    /// Seconds since start.
    pub uptime_secs: u64,
}

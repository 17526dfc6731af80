//! Process-wide relay counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotone counters plus the process start time.
pub struct RelayStats {
    started_at: Instant,
    requests_relayed: AtomicU64,
    tunnel_connections: AtomicU64,
}

/// What `/stats` reports.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub active_tunnels: usize,
    pub active_agents: usize,
    pub total_requests_relayed: u64,
    pub total_tunnel_connections: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_relayed: AtomicU64::new(0),
            tunnel_connections: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel(&self) {
        self.tunnel_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_tunnels: usize, active_agents: usize) -> StatsSnapshot {
        StatsSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            active_tunnels,
            active_agents,
            total_requests_relayed: self.requests_relayed.load(Ordering::Relaxed),
            total_tunnel_connections: self.tunnel_connections.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

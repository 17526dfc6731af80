//! HTTP ingress for the osaurus agent relay
//!
//! One axum router serves everything: the health and stats endpoints, the
//! `/tunnel/connect` WebSocket upgrade, and the host-routed relay fallback
//! that forwards `<address>.<base-domain>` traffic onto agent tunnels.

pub mod config;
pub mod handlers;
pub mod stats;
pub mod ws;

use axum::routing::{any, get};
use axum::Router;
use crate::stats::RelayStats;
use osaurus_control::tunnel::TunnelSettings;
use osaurus_control::{RateLimiter, TunnelRegistry};
use osaurus_proto::REQUEST_TIMEOUT;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

/// Tunnel-connect admissions per client IP per window.
const TUNNEL_CONNECT_LIMIT: u32 = 5;
/// Relayed requests per agent address per window.
const REQUEST_LIMIT: u32 = 100;
/// Stats requests per client IP per window.
const STATS_LIMIT: u32 = 10;
/// Refill window shared by all three limiters.
const LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// How often stale limiter buckets are swept.
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Process-wide state shared by every handler. Initialised once at startup
/// and never torn down.
pub struct AppState {
    pub registry: Arc<TunnelRegistry>,
    pub stats: Arc<RelayStats>,
    pub base_domain: String,
    pub tunnel_limiter: Arc<RateLimiter>,
    pub request_limiter: Arc<RateLimiter>,
    pub stats_limiter: Arc<RateLimiter>,
    pub settings: TunnelSettings,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(base_domain: &str) -> Self {
        Self {
            registry: Arc::new(TunnelRegistry::new()),
            stats: Arc::new(RelayStats::new()),
            base_domain: base_domain.to_ascii_lowercase(),
            tunnel_limiter: Arc::new(RateLimiter::new(TUNNEL_CONNECT_LIMIT, LIMIT_WINDOW)),
            request_limiter: Arc::new(RateLimiter::new(REQUEST_LIMIT, LIMIT_WINDOW)),
            stats_limiter: Arc::new(RateLimiter::new(STATS_LIMIT, LIMIT_WINDOW)),
            settings: TunnelSettings::default(),
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Start the periodic limiter sweeps. The tasks run for the life of the
    /// process.
    pub fn spawn_maintenance(&self) {
        let _ = self
            .tunnel_limiter
            .clone()
            .spawn_eviction_task(LIMITER_SWEEP_INTERVAL);
        let _ = self
            .request_limiter
            .clone()
            .spawn_eviction_task(LIMITER_SWEEP_INTERVAL);
        let _ = self
            .stats_limiter
            .clone()
            .spawn_eviction_task(LIMITER_SWEEP_INTERVAL);
    }
}

/// Build the ingress router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/tunnel/connect", any(handlers::tunnel_connect))
        .fallback(handlers::relay)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

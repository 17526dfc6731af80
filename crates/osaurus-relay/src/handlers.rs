//! Inbound request classification and dispatch
//!
//! Priority order: `/health`, `/stats`, `/tunnel/connect`, then host-routed
//! relay. Relay-level failures surface as JSON `{error: ...}` bodies with the
//! categorical status codes; whatever the agent answers is passed through
//! untouched apart from hop-by-hop and CORS headers.

use crate::ws::WsFrameSocket;
use crate::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use osaurus_control::relay::submit;
use osaurus_control::tunnel::{run_tunnel, TunnelContext};
use osaurus_control::{RelayRequest, RelayResponse};
use osaurus_proto::{AgentAddress, MAX_REQUEST_BODY_BYTES};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "tunnels": state.registry.active_tunnels(),
    }))
    .into_response()
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, peer);
    if !state.stats_limiter.allow(&ip) {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }
    let snapshot = state.stats.snapshot(
        state.registry.active_tunnels(),
        state.registry.active_agents(),
    );
    Json(snapshot).into_response()
}

pub async fn tunnel_connect(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let Some(upgrade) = upgrade else {
        return error_response(StatusCode::BAD_REQUEST, "websocket_required");
    };
    let ip = client_ip(&headers, peer);
    if !state.tunnel_limiter.allow(&ip) {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }

    state.stats.record_tunnel();
    info!(client = %ip, "tunnel connecting");
    let ctx = TunnelContext {
        registry: state.registry.clone(),
        base_domain: state.base_domain.clone(),
        settings: state.settings.clone(),
    };
    upgrade.on_upgrade(move |socket| run_tunnel(WsFrameSocket::new(socket), ctx))
}

/// Host-routed relay: everything that is not one of the fixed endpoints.
pub async fn relay(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(address) = headers
        .get("host")
        .and_then(|value| value.to_str().ok())
        .and_then(|host| agent_subdomain(host, &state.base_domain))
    else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_subdomain");
    };

    if method == Method::OPTIONS {
        return preflight();
    }

    if !state.request_limiter.allow(address.as_str()) {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }

    // An absent tunnel answers before the body is even considered.
    if state.registry.lookup(&address).is_none() {
        return error_response(StatusCode::BAD_GATEWAY, "agent_offline");
    }

    if declared_body_over_cap(&headers) {
        return error_response(StatusCode::PAYLOAD_TOO_LARGE, "body_too_large");
    }
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, "body_too_large"),
    };

    let client_ip = client_ip(&headers, peer);
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    debug!(%address, %method, %path, "relaying request");
    state.stats.record_request();

    let request = RelayRequest {
        method: method.to_string(),
        path,
        headers: header_pairs(&headers),
        body,
        client_ip,
    };
    into_response(submit(&state.registry, &address, request, state.request_timeout).await)
}

/// Leftmost DNS label of `host` when it sits directly under the base domain
/// and matches the agent address pattern.
fn agent_subdomain(host: &str, base_domain: &str) -> Option<AgentAddress> {
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let label = host.strip_suffix(base_domain)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    AgentAddress::parse(label).ok()
}

/// `fly-client-ip`, then the first `x-forwarded-for` entry, then the peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(ip) = headers.get("fly-client-ip").and_then(|v| v.to_str().ok()) {
        let ip = ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    peer.ip().to_string()
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("content-length")?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// `true` when the declared request body exceeds the relay cap. Bodies
/// without a declared length are caught by the capped read instead.
fn declared_body_over_cap(headers: &HeaderMap) -> bool {
    content_length(headers).is_some_and(|length| length > MAX_REQUEST_BODY_BYTES as u64)
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn error_response(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}

fn preflight() -> Response {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("access-control-allow-origin", "*")
        .header("access-control-allow-methods", "*")
        .header("access-control-allow-headers", "*")
        .header("access-control-max-age", "86400")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::NO_CONTENT.into_response())
}

fn into_response(outcome: RelayResponse) -> Response {
    match outcome {
        RelayResponse::Failed { status, error } => error_response(
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            error,
        ),
        RelayResponse::Buffered {
            status,
            headers,
            body,
        } => build_response(status, &headers, Body::from(body)),
        RelayResponse::Stream {
            status,
            headers,
            body,
        } => build_response(
            status,
            &headers,
            Body::from_stream(UnboundedReceiverStream::new(body)),
        ),
    }
}

fn build_response(status: u16, headers: &HashMap<String, String>, body: Body) -> Response {
    let mut builder =
        Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => debug!(header = %name, "dropping invalid response header"),
        }
    }
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

//! HTTP ↔ tunnel request multiplexer
//!
//! Submits an inbound HTTP request as a `request` frame on the tunnel
//! currently serving the target address, then awaits either a buffered
//! response, a stream handoff, or a deadline. Header hygiene for both
//! directions lives here so the ingress and the tunnel agree on one policy.

use crate::registry::TunnelRegistry;
use crate::tunnel::{StreamClosed, TunnelReply};
use bytes::Bytes;
use osaurus_proto::{AgentAddress, ServerFrame};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Request headers that must never reach the agent.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "cookie",
    "authorization",
    "proxy-authorization",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-port",
    "x-real-ip",
];

/// Header-name prefixes injected by fronting infrastructure.
const STRIPPED_REQUEST_PREFIXES: &[&str] = &["fly-", "cf-"];

/// Hop-by-hop headers stripped from agent responses.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// An inbound request ready to relay.
#[derive(Debug)]
pub struct RelayRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub client_ip: String,
}

/// Outcome of relaying one request.
pub enum RelayResponse {
    Buffered {
        status: u16,
        headers: HashMap<String, String>,
        body: Bytes,
    },
    Stream {
        status: u16,
        headers: HashMap<String, String>,
        body: mpsc::UnboundedReceiver<Result<Bytes, StreamClosed>>,
    },
    /// A relay-level failure with its categorical error code.
    Failed { status: u16, error: &'static str },
}

/// Relay one HTTP request to the tunnel currently holding `address`.
pub async fn submit(
    registry: &TunnelRegistry,
    address: &AgentAddress,
    request: RelayRequest,
    timeout: Duration,
) -> RelayResponse {
    let Some(tunnel) = registry.lookup(address) else {
        return RelayResponse::Failed {
            status: 502,
            error: "agent_offline",
        };
    };

    let id = Uuid::new_v4().to_string();
    let frame = ServerFrame::Request {
        id: id.clone(),
        method: request.method,
        path: request.path,
        headers: sanitize_request_headers(&request.headers, address, &request.client_ip),
        body: String::from_utf8_lossy(&request.body).into_owned(),
    };

    let reply = tunnel.register_in_flight(&id);
    if tunnel.send_frame(frame).await.is_err() {
        tunnel.abandon_in_flight(&id);
        return RelayResponse::Failed {
            status: 502,
            error: "tunnel_send_failed",
        };
    }

    match tokio::time::timeout(timeout, reply).await {
        Err(_) => {
            debug!(%address, request = %id, "request deadline elapsed");
            tunnel.abandon_in_flight(&id);
            RelayResponse::Failed {
                status: 504,
                error: "gateway_timeout",
            }
        }
        Ok(Err(_)) | Ok(Ok(TunnelReply::Closed)) => RelayResponse::Failed {
            status: 502,
            error: "tunnel_closed",
        },
        Ok(Ok(TunnelReply::Buffered {
            status,
            headers,
            body,
        })) => RelayResponse::Buffered {
            status,
            headers: sanitize_response_headers(&headers),
            body: Bytes::from(body.into_bytes()),
        },
        Ok(Ok(TunnelReply::Stream {
            status,
            headers,
            body,
        })) => RelayResponse::Stream {
            status,
            headers: sanitize_response_headers(&headers),
            body,
        },
    }
}

/// Lowercase the survivors, drop leak-prone names, and inject the relay
/// metadata the agent needs.
pub fn sanitize_request_headers(
    headers: &[(String, String)],
    address: &AgentAddress,
    client_ip: &str,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if STRIPPED_REQUEST_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            continue;
        }
        out.insert(name, value.clone());
    }
    out.insert("x-agent-address".to_string(), address.to_string());
    out.insert("x-forwarded-for".to_string(), client_ip.to_string());
    out
}

/// Strip hop-by-hop headers and apply the permissive CORS policy.
pub fn sanitize_response_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.insert(name, value.clone());
    }
    out.insert("access-control-allow-origin".to_string(), "*".to_string());
    out.insert("access-control-expose-headers".to_string(), "*".to_string());
    out
}

//! End-to-end tunnel lifecycle tests over the in-memory socket pair
//!
//! Each test dials a tunnel, authenticates with real secp256k1 keys, and
//! exercises the relay path exactly the way the WebSocket ingress does.

use bytes::Bytes;
use k256::ecdsa::SigningKey;
use osaurus_auth::{canonical_message, eth_signed_message, unix_now};
use osaurus_control::{
    memory_pair, relay, run_tunnel, MemoryFrame, MemorySocket, RelayRequest, RelayResponse,
    TunnelContext, TunnelRegistry, TunnelSettings,
};
use osaurus_proto::{
    AgentAddress, AgentCredential, ClientFrame, ServerFrame, CLOSE_AUTH_FAILED, CLOSE_KEEPALIVE,
    CLOSE_MALFORMED,
};
use rand::rngs::OsRng;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const BASE_DOMAIN: &str = "agent.osaurus.ai";

struct Identity {
    key: SigningKey,
    address: AgentAddress,
}

fn identity() -> Identity {
    let key = SigningKey::random(&mut OsRng);
    let point = key.verifying_key().to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    let address = AgentAddress::parse(&format!("0x{}", hex::encode(&hash[12..]))).unwrap();
    Identity { key, address }
}

fn sign_personal(key: &SigningKey, message: &str) -> String {
    let digest = Keccak256::new_with_prefix(eth_signed_message(message));
    let (sig, recovery) = key.sign_digest_recoverable(digest).unwrap();
    let mut raw = sig.to_bytes().to_vec();
    raw.push(recovery.to_byte() + 27);
    format!("0x{}", hex::encode(raw))
}

fn credential(identity: &Identity, nonce: &str, timestamp: i64) -> AgentCredential {
    let message = canonical_message(&identity.address, nonce, timestamp);
    AgentCredential {
        address: identity.address.to_string(),
        signature: sign_personal(&identity.key, &message),
    }
}

async fn send(client: &mut MemorySocket, frame: &ClientFrame) {
    let text = serde_json::to_string(frame).unwrap();
    client.send_raw(MemoryFrame::Text(text)).await.unwrap();
}

async fn recv(client: &mut MemorySocket) -> ServerFrame {
    let frame = tokio::time::timeout(Duration::from_secs(5), client.recv_raw())
        .await
        .expect("timed out waiting for a frame");
    match frame {
        Some(MemoryFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Read frames until the close frame arrives, returning its code and any
/// ping frames seen on the way.
async fn recv_close(client: &mut MemorySocket) -> (u16, Vec<ServerFrame>) {
    let mut seen = Vec::new();
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.recv_raw())
            .await
            .expect("timed out waiting for close");
        match frame {
            Some(MemoryFrame::Text(text)) => seen.push(serde_json::from_str(&text).unwrap()),
            Some(MemoryFrame::Close { code, .. }) => return (code, seen),
            None => panic!("socket dropped without a close frame"),
        }
    }
}

/// Dial a tunnel and send an `auth` frame for the given identities. The
/// caller reads the `auth_ok` (or error) that follows.
async fn connect(
    registry: &Arc<TunnelRegistry>,
    ids: &[&Identity],
    settings: TunnelSettings,
) -> MemorySocket {
    let (server, mut client) = memory_pair(64);
    let ctx = TunnelContext {
        registry: registry.clone(),
        base_domain: BASE_DOMAIN.to_string(),
        settings,
    };
    tokio::spawn(run_tunnel(server, ctx));

    let ServerFrame::Challenge { nonce } = recv(&mut client).await else {
        panic!("expected the initial challenge");
    };
    let now = unix_now();
    let agents = ids.iter().map(|id| credential(id, &nonce, now)).collect();
    send(
        &mut client,
        &ClientFrame::Auth {
            agents,
            nonce,
            timestamp: now,
        },
    )
    .await;
    client
}

fn expect_auth_ok(frame: ServerFrame) -> (Vec<osaurus_proto::AgentEndpoint>, Option<Vec<osaurus_proto::RejectedAgent>>) {
    match frame {
        ServerFrame::AuthOk { agents, rejected } => (agents, rejected),
        other => panic!("expected auth_ok, got {other:?}"),
    }
}

fn post_request(path: &str, body: &'static [u8]) -> RelayRequest {
    RelayRequest {
        method: "POST".to_string(),
        path: path.to_string(),
        headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        body: Bytes::from_static(body),
        client_ip: "203.0.113.9".to_string(),
    }
}

fn spawn_submit(
    registry: &Arc<TunnelRegistry>,
    address: &AgentAddress,
    request: RelayRequest,
    timeout: Duration,
) -> tokio::task::JoinHandle<RelayResponse> {
    let registry = registry.clone();
    let address = address.clone();
    tokio::spawn(async move { relay::submit(&registry, &address, request, timeout).await })
}

#[tokio::test]
async fn test_single_agent_happy_path() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let mut client = connect(&registry, &[&agent], TunnelSettings::default()).await;

    let (accepted, rejected) = expect_auth_ok(recv(&mut client).await);
    assert!(rejected.is_none());
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].address, agent.address.to_string());
    assert_eq!(
        accepted[0].url,
        format!("https://{}.{}", agent.address, BASE_DOMAIN)
    );
    assert!(registry.lookup(&agent.address).is_some());

    let pending = spawn_submit(
        &registry,
        &agent.address,
        post_request("/chat", b"{\"message\":\"hello\"}"),
        Duration::from_secs(5),
    );

    let id = match recv(&mut client).await {
        ServerFrame::Request {
            id,
            method,
            path,
            headers,
            body,
        } => {
            assert_eq!(method, "POST");
            assert_eq!(path, "/chat");
            assert_eq!(
                headers.get("x-agent-address"),
                Some(&agent.address.to_string())
            );
            assert_eq!(
                headers.get("x-forwarded-for").map(String::as_str),
                Some("203.0.113.9")
            );
            assert_eq!(
                headers.get("content-type").map(String::as_str),
                Some("application/json")
            );
            assert!(!headers.contains_key("host"));
            assert_eq!(body, "{\"message\":\"hello\"}");
            id
        }
        other => panic!("expected request frame, got {other:?}"),
    };

    send(
        &mut client,
        &ClientFrame::Response {
            id,
            status: 200,
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: "{\"echo\":true,\"path\":\"/chat\"}".to_string(),
        },
    )
    .await;

    match pending.await.unwrap() {
        RelayResponse::Buffered {
            status,
            headers,
            body,
        } => {
            assert_eq!(status, 200);
            assert_eq!(
                headers.get("content-type").map(String::as_str),
                Some("application/json")
            );
            assert_eq!(
                headers.get("access-control-allow-origin").map(String::as_str),
                Some("*")
            );
            assert_eq!(body, Bytes::from_static(b"{\"echo\":true,\"path\":\"/chat\"}"));
        }
        _ => panic!("expected a buffered response"),
    }
}

#[tokio::test]
async fn test_streaming_response() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let mut client = connect(&registry, &[&agent], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut client).await);

    let pending = spawn_submit(
        &registry,
        &agent.address,
        post_request("/chat", b"{}"),
        Duration::from_secs(5),
    );

    let ServerFrame::Request { id, .. } = recv(&mut client).await else {
        panic!("expected request frame");
    };

    send(
        &mut client,
        &ClientFrame::StreamStart {
            id: id.clone(),
            status: 200,
            headers: HashMap::from([(
                "content-type".to_string(),
                "text/event-stream".to_string(),
            )]),
        },
    )
    .await;
    for chunk in ["data: a\n\n", "data: b\n\n"] {
        send(
            &mut client,
            &ClientFrame::StreamChunk {
                id: id.clone(),
                data: chunk.to_string(),
            },
        )
        .await;
    }
    send(&mut client, &ClientFrame::StreamEnd { id }).await;

    match pending.await.unwrap() {
        RelayResponse::Stream {
            status,
            headers,
            mut body,
        } => {
            assert_eq!(status, 200);
            assert_eq!(
                headers.get("content-type").map(String::as_str),
                Some("text/event-stream")
            );
            let mut collected = Vec::new();
            while let Some(chunk) = body.recv().await {
                collected.extend_from_slice(&chunk.unwrap());
            }
            assert_eq!(collected, b"data: a\n\ndata: b\n\n");
        }
        _ => panic!("expected a streaming response"),
    }
}

#[tokio::test]
async fn test_stream_errors_when_tunnel_closes_mid_stream() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let mut client = connect(&registry, &[&agent], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut client).await);

    let pending = spawn_submit(
        &registry,
        &agent.address,
        post_request("/chat", b"{}"),
        Duration::from_secs(5),
    );

    let ServerFrame::Request { id, .. } = recv(&mut client).await else {
        panic!("expected request frame");
    };
    send(
        &mut client,
        &ClientFrame::StreamStart {
            id: id.clone(),
            status: 200,
            headers: HashMap::new(),
        },
    )
    .await;
    send(
        &mut client,
        &ClientFrame::StreamChunk {
            id,
            data: "partial".to_string(),
        },
    )
    .await;

    let RelayResponse::Stream { mut body, .. } = pending.await.unwrap() else {
        panic!("expected a streaming response");
    };
    assert_eq!(body.recv().await.unwrap().unwrap(), Bytes::from_static(b"partial"));

    // The agent connection dies before stream_end.
    drop(client);

    match body.recv().await {
        Some(Err(_)) => {}
        other => panic!("expected an errored end-of-stream, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_address_keeps_first_binding() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();

    let mut first = connect(&registry, &[&agent], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut first).await);

    let mut second = connect(&registry, &[&agent], TunnelSettings::default()).await;
    let (accepted, rejected) = expect_auth_ok(recv(&mut second).await);
    assert!(accepted.is_empty());
    let rejected = rejected.expect("second tunnel must see a rejection");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].address, agent.address.to_string());
    assert_eq!(rejected[0].reason, "already_registered");

    // Traffic still routes to the first tunnel.
    let pending = spawn_submit(
        &registry,
        &agent.address,
        post_request("/ping", b"{}"),
        Duration::from_secs(5),
    );
    let ServerFrame::Request { id, .. } = recv(&mut first).await else {
        panic!("request must arrive on the first tunnel");
    };
    send(
        &mut first,
        &ClientFrame::Response {
            id,
            status: 200,
            headers: HashMap::new(),
            body: "ok".to_string(),
        },
    )
    .await;
    match pending.await.unwrap() {
        RelayResponse::Buffered { status, .. } => assert_eq!(status, 200),
        _ => panic!("expected a buffered response"),
    }
}

#[tokio::test]
async fn test_stale_teardown_does_not_evict_new_owner() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();

    let mut first = connect(&registry, &[&agent], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut first).await);

    send(
        &mut first,
        &ClientFrame::RemoveAgent {
            address: agent.address.to_string(),
        },
    )
    .await;
    match recv(&mut first).await {
        ServerFrame::AgentRemoved { address } => assert_eq!(address, agent.address.to_string()),
        other => panic!("expected agent_removed, got {other:?}"),
    }

    let mut second = connect(&registry, &[&agent], TunnelSettings::default()).await;
    let (accepted, rejected) = expect_auth_ok(recv(&mut second).await);
    assert_eq!(accepted.len(), 1);
    assert!(rejected.is_none());

    // The first connection goes away afterwards; its teardown must not evict
    // the second tunnel's binding.
    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pending = spawn_submit(
        &registry,
        &agent.address,
        post_request("/after", b"{}"),
        Duration::from_secs(5),
    );
    let ServerFrame::Request { id, .. } = recv(&mut second).await else {
        panic!("request must route to the new tunnel");
    };
    send(
        &mut second,
        &ClientFrame::Response {
            id,
            status: 204,
            headers: HashMap::new(),
            body: String::new(),
        },
    )
    .await;
    match pending.await.unwrap() {
        RelayResponse::Buffered { status, .. } => assert_eq!(status, 204),
        _ => panic!("expected a buffered response"),
    }
}

#[tokio::test]
async fn test_add_agent_nonce_is_single_use() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let extra = identity();
    let replayer = identity();

    let mut client = connect(&registry, &[&agent], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut client).await);

    send(&mut client, &ClientFrame::RequestChallenge).await;
    let ServerFrame::Challenge { nonce } = recv(&mut client).await else {
        panic!("expected a fresh challenge");
    };

    let now = unix_now();
    let cred = credential(&extra, &nonce, now);
    send(
        &mut client,
        &ClientFrame::AddAgent {
            address: cred.address,
            signature: cred.signature,
            nonce: nonce.clone(),
            timestamp: now,
        },
    )
    .await;
    match recv(&mut client).await {
        ServerFrame::AgentAdded { address, url } => {
            assert_eq!(address, extra.address.to_string());
            assert_eq!(url, format!("https://{}.{}", extra.address, BASE_DOMAIN));
        }
        other => panic!("expected agent_added, got {other:?}"),
    }

    // Replaying the consumed nonce fails even with a valid signature.
    let replay = credential(&replayer, &nonce, now);
    send(
        &mut client,
        &ClientFrame::AddAgent {
            address: replay.address,
            signature: replay.signature,
            nonce,
            timestamp: now,
        },
    )
    .await;
    match recv(&mut client).await {
        ServerFrame::Error { error } => assert_eq!(error, "invalid_nonce"),
        other => panic!("expected invalid_nonce, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_add_agent_signature_burns_nonce() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let extra = identity();

    let mut client = connect(&registry, &[&agent], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut client).await);

    send(&mut client, &ClientFrame::RequestChallenge).await;
    let ServerFrame::Challenge { nonce } = recv(&mut client).await else {
        panic!("expected a fresh challenge");
    };

    let now = unix_now();
    send(
        &mut client,
        &ClientFrame::AddAgent {
            address: extra.address.to_string(),
            signature: "0xdeadbeef".to_string(),
            nonce: nonce.clone(),
            timestamp: now,
        },
    )
    .await;
    match recv(&mut client).await {
        ServerFrame::Error { error } => assert_eq!(error, "invalid_signature"),
        other => panic!("expected invalid_signature, got {other:?}"),
    }

    // Verification was attempted, so the nonce is gone.
    let cred = credential(&extra, &nonce, now);
    send(
        &mut client,
        &ClientFrame::AddAgent {
            address: cred.address,
            signature: cred.signature,
            nonce,
            timestamp: now,
        },
    )
    .await;
    match recv(&mut client).await {
        ServerFrame::Error { error } => assert_eq!(error, "invalid_nonce"),
        other => panic!("expected invalid_nonce, got {other:?}"),
    }
}

#[tokio::test]
async fn test_max_agents_reached_preserves_nonce() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let extra = identity();
    let settings = TunnelSettings {
        max_agents: 1,
        ..TunnelSettings::default()
    };

    let mut client = connect(&registry, &[&agent], settings).await;
    expect_auth_ok(recv(&mut client).await);

    send(&mut client, &ClientFrame::RequestChallenge).await;
    let ServerFrame::Challenge { nonce } = recv(&mut client).await else {
        panic!("expected a fresh challenge");
    };

    let now = unix_now();
    let cred = credential(&extra, &nonce, now);
    send(
        &mut client,
        &ClientFrame::AddAgent {
            address: cred.address.clone(),
            signature: cred.signature.clone(),
            nonce: nonce.clone(),
            timestamp: now,
        },
    )
    .await;
    match recv(&mut client).await {
        ServerFrame::Error { error } => assert_eq!(error, "max_agents_reached"),
        other => panic!("expected max_agents_reached, got {other:?}"),
    }

    // No verification happened, so the same challenge still works once room
    // frees up.
    send(
        &mut client,
        &ClientFrame::RemoveAgent {
            address: agent.address.to_string(),
        },
    )
    .await;
    match recv(&mut client).await {
        ServerFrame::AgentRemoved { .. } => {}
        other => panic!("expected agent_removed, got {other:?}"),
    }

    send(
        &mut client,
        &ClientFrame::AddAgent {
            address: cred.address,
            signature: cred.signature,
            nonce,
            timestamp: now,
        },
    )
    .await;
    match recv(&mut client).await {
        ServerFrame::AgentAdded { address, .. } => assert_eq!(address, extra.address.to_string()),
        other => panic!("expected agent_added, got {other:?}"),
    }
}

#[tokio::test]
async fn test_add_agent_for_taken_address() {
    let registry = Arc::new(TunnelRegistry::new());
    let holder = identity();
    let agent = identity();

    let mut first = connect(&registry, &[&holder], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut first).await);

    let mut second = connect(&registry, &[&agent], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut second).await);

    send(&mut second, &ClientFrame::RequestChallenge).await;
    let ServerFrame::Challenge { nonce } = recv(&mut second).await else {
        panic!("expected a fresh challenge");
    };
    let now = unix_now();
    let cred = credential(&holder, &nonce, now);
    send(
        &mut second,
        &ClientFrame::AddAgent {
            address: cred.address,
            signature: cred.signature,
            nonce,
            timestamp: now,
        },
    )
    .await;
    match recv(&mut second).await {
        ServerFrame::Error { error } => assert_eq!(error, "address_already_registered"),
        other => panic!("expected address_already_registered, got {other:?}"),
    }

    // The holder keeps its binding; the second tunnel never gained it.
    let bound = registry.lookup(&holder.address).expect("binding must survive");
    assert!(bound.owns(&holder.address));
    assert_eq!(registry.active_agents(), 2);
}

#[tokio::test]
async fn test_auth_with_wrong_nonce_is_fatal() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let (server, mut client) = memory_pair(8);
    let ctx = TunnelContext {
        registry: registry.clone(),
        base_domain: BASE_DOMAIN.to_string(),
        settings: TunnelSettings::default(),
    };
    tokio::spawn(run_tunnel(server, ctx));

    let ServerFrame::Challenge { .. } = recv(&mut client).await else {
        panic!("expected challenge");
    };
    let now = unix_now();
    let wrong = "00".repeat(32);
    send(
        &mut client,
        &ClientFrame::Auth {
            agents: vec![credential(&agent, &wrong, now)],
            nonce: wrong.clone(),
            timestamp: now,
        },
    )
    .await;

    match recv(&mut client).await {
        ServerFrame::AuthError { error } => assert_eq!(error, "invalid_nonce"),
        other => panic!("expected auth_error, got {other:?}"),
    }
    let (code, _) = recv_close(&mut client).await;
    assert_eq!(code, CLOSE_AUTH_FAILED);
    assert!(registry.lookup(&agent.address).is_none());
}

#[tokio::test]
async fn test_auth_timeout_closes_the_socket() {
    let registry = Arc::new(TunnelRegistry::new());
    let (server, mut client) = memory_pair(8);
    let ctx = TunnelContext {
        registry: registry.clone(),
        base_domain: BASE_DOMAIN.to_string(),
        settings: TunnelSettings {
            auth_timeout: Duration::from_millis(100),
            ..TunnelSettings::default()
        },
    };
    tokio::spawn(run_tunnel(server, ctx));

    let ServerFrame::Challenge { .. } = recv(&mut client).await else {
        panic!("expected challenge");
    };
    match recv(&mut client).await {
        ServerFrame::AuthError { error } => assert_eq!(error, "auth_timeout"),
        other => panic!("expected auth_error, got {other:?}"),
    }
    let (code, _) = recv_close(&mut client).await;
    assert_eq!(code, CLOSE_AUTH_FAILED);
}

#[tokio::test]
async fn test_agent_cap_at_auth() {
    let registry = Arc::new(TunnelRegistry::new());
    let identities: Vec<Identity> = (0..51).map(|_| identity()).collect();

    // 50 agents is accepted.
    let first_fifty: Vec<&Identity> = identities.iter().take(50).collect();
    let mut client = connect(&registry, &first_fifty, TunnelSettings::default()).await;
    let (accepted, rejected) = expect_auth_ok(recv(&mut client).await);
    assert_eq!(accepted.len(), 50);
    assert!(rejected.is_none());
    drop(client);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 51 is refused outright.
    let all: Vec<&Identity> = identities.iter().collect();
    let mut client = connect(&registry, &all, TunnelSettings::default()).await;
    match recv(&mut client).await {
        ServerFrame::AuthError { error } => assert_eq!(error, "too_many_agents"),
        other => panic!("expected too_many_agents, got {other:?}"),
    }
    let (code, _) = recv_close(&mut client).await;
    assert_eq!(code, CLOSE_MALFORMED);
}

#[tokio::test]
async fn test_request_deadline_yields_gateway_timeout() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let mut client = connect(&registry, &[&agent], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut client).await);

    let pending = spawn_submit(
        &registry,
        &agent.address,
        post_request("/slow", b"{}"),
        Duration::from_millis(100),
    );

    // The agent reads the request but never answers.
    let ServerFrame::Request { .. } = recv(&mut client).await else {
        panic!("expected request frame");
    };

    match pending.await.unwrap() {
        RelayResponse::Failed { status, error } => {
            assert_eq!(status, 504);
            assert_eq!(error, "gateway_timeout");
        }
        _ => panic!("expected a gateway timeout"),
    }
}

#[tokio::test]
async fn test_teardown_completes_in_flight_requests() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let mut client = connect(&registry, &[&agent], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut client).await);

    let pending = spawn_submit(
        &registry,
        &agent.address,
        post_request("/never", b"{}"),
        Duration::from_secs(5),
    );
    let ServerFrame::Request { .. } = recv(&mut client).await else {
        panic!("expected request frame");
    };

    drop(client);

    match pending.await.unwrap() {
        RelayResponse::Failed { status, error } => {
            assert_eq!(status, 502);
            assert_eq!(error, "tunnel_closed");
        }
        _ => panic!("expected tunnel_closed"),
    }
    assert!(registry.lookup(&agent.address).is_none());
    assert_eq!(registry.active_tunnels(), 0);
}

#[tokio::test]
async fn test_keepalive_timeout_closes_with_1000() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let settings = TunnelSettings {
        keepalive_interval: Duration::from_millis(50),
        ..TunnelSettings::default()
    };
    let mut client = connect(&registry, &[&agent], settings).await;
    expect_auth_ok(recv(&mut client).await);

    let (code, seen) = recv_close(&mut client).await;
    assert_eq!(code, CLOSE_KEEPALIVE);
    let pings = seen
        .iter()
        .filter(|frame| matches!(frame, ServerFrame::Ping { .. }))
        .count();
    assert_eq!(pings, 3);
}

#[tokio::test]
async fn test_pong_keeps_the_tunnel_alive() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let settings = TunnelSettings {
        keepalive_interval: Duration::from_millis(50),
        ..TunnelSettings::default()
    };
    let mut client = connect(&registry, &[&agent], settings).await;
    expect_auth_ok(recv(&mut client).await);

    for _ in 0..5 {
        match recv(&mut client).await {
            ServerFrame::Ping { ts } => send(&mut client, &ClientFrame::Pong { ts }).await,
            other => panic!("expected ping, got {other:?}"),
        }
    }
    assert!(registry.lookup(&agent.address).is_some());
}

#[tokio::test]
async fn test_remove_agent_not_owned_is_a_noop() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let stranger = identity();
    let mut client = connect(&registry, &[&agent], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut client).await);

    send(
        &mut client,
        &ClientFrame::RemoveAgent {
            address: stranger.address.to_string(),
        },
    )
    .await;

    // No frame comes back and the owned binding is untouched.
    let silence = tokio::time::timeout(Duration::from_millis(200), client.recv_raw()).await;
    assert!(silence.is_err());
    assert!(registry.lookup(&agent.address).is_some());
}

#[tokio::test]
async fn test_stream_idle_timeout_ends_the_body_normally() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let settings = TunnelSettings {
        stream_idle_timeout: Duration::from_millis(100),
        ..TunnelSettings::default()
    };
    let mut client = connect(&registry, &[&agent], settings).await;
    expect_auth_ok(recv(&mut client).await);

    let pending = spawn_submit(
        &registry,
        &agent.address,
        post_request("/events", b"{}"),
        Duration::from_secs(5),
    );
    let ServerFrame::Request { id, .. } = recv(&mut client).await else {
        panic!("expected request frame");
    };
    send(
        &mut client,
        &ClientFrame::StreamStart {
            id: id.clone(),
            status: 200,
            headers: HashMap::new(),
        },
    )
    .await;
    send(
        &mut client,
        &ClientFrame::StreamChunk {
            id,
            data: "tick".to_string(),
        },
    )
    .await;

    let RelayResponse::Stream { mut body, .. } = pending.await.unwrap() else {
        panic!("expected a streaming response");
    };
    assert_eq!(body.recv().await.unwrap().unwrap(), Bytes::from_static(b"tick"));

    // No further chunks: the idle watchdog closes the body without an error.
    let end = tokio::time::timeout(Duration::from_secs(2), body.recv()).await;
    assert!(matches!(end, Ok(None)));
}

#[tokio::test]
async fn test_malformed_frames_are_dropped_post_auth() {
    let registry = Arc::new(TunnelRegistry::new());
    let agent = identity();
    let mut client = connect(&registry, &[&agent], TunnelSettings::default()).await;
    expect_auth_ok(recv(&mut client).await);

    client
        .send_raw(MemoryFrame::Text("{not json".to_string()))
        .await
        .unwrap();
    client
        .send_raw(MemoryFrame::Text("{\"type\":\"mystery\"}".to_string()))
        .await
        .unwrap();

    // The tunnel survives and still answers protocol frames.
    send(&mut client, &ClientFrame::RequestChallenge).await;
    match recv(&mut client).await {
        ServerFrame::Challenge { .. } => {}
        other => panic!("expected challenge, got {other:?}"),
    }
}

//! Per-connection tunnel state machine
//!
//! Each tunnel is driven by a single task that owns the socket: it issues the
//! initial challenge, runs the auth handshake, then serves the authenticated
//! frame loop. Writes from the multiplexer are published into an outbox queue
//! the driver drains, so all state belonging to one tunnel is serialised
//! behind its driver.

use crate::registry::TunnelRegistry;
use crate::transport::{FrameSocket, SocketError, SocketEvent};
use bytes::Bytes;
use osaurus_auth::{nonce, unix_now, verify_agent, verify_all};
use osaurus_proto::{
    AgentAddress, AgentEndpoint, ClientFrame, RejectedAgent, ServerFrame, AUTH_TIMEOUT,
    CLOSE_AUTH_FAILED, CLOSE_KEEPALIVE, CLOSE_MALFORMED, KEEPALIVE_INTERVAL,
    MAX_AGENTS_PER_TUNNEL, MAX_AUTH_FRAME_BYTES, MAX_FRAME_BYTES, MAX_UNANSWERED_PINGS,
    NONCE_TTL, STREAM_IDLE_TIMEOUT,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Timing and capacity knobs for a tunnel. Defaults are the production
/// values; tests shrink them.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub auth_timeout: Duration,
    pub keepalive_interval: Duration,
    pub nonce_ttl: Duration,
    pub stream_idle_timeout: Duration,
    pub max_agents: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            auth_timeout: AUTH_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            nonce_ttl: NONCE_TTL,
            stream_idle_timeout: STREAM_IDLE_TIMEOUT,
            max_agents: MAX_AGENTS_PER_TUNNEL,
        }
    }
}

/// Everything a tunnel needs from its host process.
#[derive(Clone)]
pub struct TunnelContext {
    pub registry: Arc<TunnelRegistry>,
    pub base_domain: String,
    pub settings: TunnelSettings,
}

/// The tunnel disappeared mid-stream; surfaced on the body channel so the
/// HTTP reader observes an errored end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("tunnel closed before the stream finished")]
pub struct StreamClosed;

/// Completion of an in-flight relayed request.
#[derive(Debug)]
pub enum TunnelReply {
    /// A `response` frame: the whole reply at once.
    Buffered {
        status: u16,
        headers: HashMap<String, String>,
        body: String,
    },
    /// A `stream_start` frame: body chunks follow on the channel until it
    /// closes (normal end) or yields an error (tunnel teardown).
    Stream {
        status: u16,
        headers: HashMap<String, String>,
        body: mpsc::UnboundedReceiver<Result<Bytes, StreamClosed>>,
    },
    /// The tunnel tore down before the agent replied.
    Closed,
}

/// A send on a tunnel that has already torn down.
#[derive(Debug, thiserror::Error)]
#[error("tunnel is closed")]
pub struct TunnelClosed;

struct StreamEntry {
    sink: mpsc::UnboundedSender<Result<Bytes, StreamClosed>>,
    idle_deadline: Arc<Mutex<Instant>>,
    watchdog: tokio::task::JoinHandle<()>,
}

struct PendingNonce {
    nonce: String,
    expires_at: Instant,
}

/// One authenticated (or authenticating) tunnel connection.
///
/// Shared between the driver task and the multiplexer; the driver retains
/// authoritative lifetime and is the only caller of [`Tunnel::teardown`].
pub struct Tunnel {
    id: String,
    outbox: mpsc::Sender<ServerFrame>,
    in_flight: Mutex<HashMap<String, oneshot::Sender<TunnelReply>>>,
    streams: Mutex<HashMap<String, StreamEntry>>,
    agents: Mutex<HashSet<AgentAddress>>,
    pending_nonce: Mutex<Option<PendingNonce>>,
    unanswered_pings: AtomicU32,
    closed: AtomicBool,
    settings: TunnelSettings,
}

impl Tunnel {
    /// Build a tunnel around an outbox queue. [`run_tunnel`] constructs one
    /// for its socket; tests wire one straight into a registry.
    pub fn new(outbox: mpsc::Sender<ServerFrame>, settings: TunnelSettings) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            outbox,
            in_flight: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            agents: Mutex::new(HashSet::new()),
            pending_nonce: Mutex::new(None),
            unanswered_pings: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            settings,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn agent_count(&self) -> usize {
        self.agents.lock().unwrap().len()
    }

    pub fn owns(&self, address: &AgentAddress) -> bool {
        self.agents.lock().unwrap().contains(address)
    }

    pub(crate) fn add_agent_local(&self, address: AgentAddress) {
        self.agents.lock().unwrap().insert(address);
    }

    pub(crate) fn remove_agent_local(&self, address: &AgentAddress) {
        self.agents.lock().unwrap().remove(address);
    }

    /// Queue a frame for the socket writer.
    pub async fn send_frame(&self, frame: ServerFrame) -> Result<(), TunnelClosed> {
        if self.is_closed() {
            return Err(TunnelClosed);
        }
        self.outbox.send(frame).await.map_err(|_| TunnelClosed)
    }

    /// Register an in-flight request awaiting its reply frame.
    pub fn register_in_flight(&self, id: &str) -> oneshot::Receiver<TunnelReply> {
        let (tx, rx) = oneshot::channel();
        self.in_flight.lock().unwrap().insert(id.to_string(), tx);
        // Teardown may have drained the table before this entry landed; the
        // closed flag is set before the drain, so re-checking here closes the
        // race without a double completion.
        if self.is_closed() {
            if let Some(tx) = self.in_flight.lock().unwrap().remove(id) {
                let _ = tx.send(TunnelReply::Closed);
            }
        }
        rx
    }

    /// Forget an in-flight request (deadline fired or the send failed).
    pub fn abandon_in_flight(&self, id: &str) {
        self.in_flight.lock().unwrap().remove(id);
    }

    fn complete_buffered(&self, id: &str, status: u16, headers: HashMap<String, String>, body: String) {
        match self.in_flight.lock().unwrap().remove(id) {
            Some(tx) => {
                let _ = tx.send(TunnelReply::Buffered {
                    status,
                    headers,
                    body,
                });
            }
            None => debug!(tunnel = %self.id, request = id, "response for unknown request, dropping"),
        }
    }

    fn push_chunk(&self, id: &str, data: String) {
        let mut streams = self.streams.lock().unwrap();
        let Some(entry) = streams.get(id) else {
            debug!(tunnel = %self.id, request = id, "chunk for unknown stream, dropping");
            return;
        };
        *entry.idle_deadline.lock().unwrap() = Instant::now() + self.settings.stream_idle_timeout;
        let reader_gone = entry.sink.send(Ok(Bytes::from(data.into_bytes()))).is_err();
        if reader_gone {
            // The HTTP reader went away; discard the stream so later chunks
            // stop here.
            if let Some(entry) = streams.remove(id) {
                entry.watchdog.abort();
            }
        }
    }

    fn finish_stream(&self, id: &str) {
        if let Some(entry) = self.streams.lock().unwrap().remove(id) {
            entry.watchdog.abort();
            // Dropping the sink closes the body normally.
        }
    }

    /// Idempotent teardown: complete every in-flight request, error every
    /// stream sink, and release every owned address (only where this tunnel
    /// is still the registered owner).
    pub(crate) fn teardown(&self, registry: &TunnelRegistry) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<_> = self.in_flight.lock().unwrap().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(TunnelReply::Closed);
        }
        let streams: Vec<_> = self.streams.lock().unwrap().drain().collect();
        for (_, entry) in streams {
            entry.watchdog.abort();
            let _ = entry.sink.send(Err(StreamClosed));
        }
        let owned: Vec<_> = self.agents.lock().unwrap().iter().cloned().collect();
        for address in owned {
            registry.unregister(self, &address);
        }
        registry.detach(self);
        *self.pending_nonce.lock().unwrap() = None;
        info!(tunnel = %self.id, "tunnel torn down");
    }
}

/// Hand an in-flight request off to a stream: the oneshot completes with the
/// chunk channel and the idle watchdog starts.
fn start_stream(tunnel: &Arc<Tunnel>, id: &str, status: u16, headers: HashMap<String, String>) {
    let Some(tx) = tunnel.in_flight.lock().unwrap().remove(id) else {
        debug!(tunnel = %tunnel.id, request = id, "stream_start for unknown request, dropping");
        return;
    };
    let (sink, body) = mpsc::unbounded_channel();
    let idle_deadline = Arc::new(Mutex::new(
        Instant::now() + tunnel.settings.stream_idle_timeout,
    ));
    let watchdog = tokio::spawn(stream_watchdog(
        Arc::downgrade(tunnel),
        id.to_string(),
        idle_deadline.clone(),
    ));
    tunnel.streams.lock().unwrap().insert(
        id.to_string(),
        StreamEntry {
            sink,
            idle_deadline,
            watchdog,
        },
    );
    let _ = tx.send(TunnelReply::Stream {
        status,
        headers,
        body,
    });
}

/// Close the stream normally when no chunk arrives before the idle deadline.
async fn stream_watchdog(tunnel: Weak<Tunnel>, id: String, deadline: Arc<Mutex<Instant>>) {
    loop {
        let at = *deadline.lock().unwrap();
        tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
        if Instant::now() >= *deadline.lock().unwrap() {
            if let Some(tunnel) = tunnel.upgrade() {
                if tunnel.streams.lock().unwrap().remove(&id).is_some() {
                    debug!(tunnel = %tunnel.id, request = %id, "stream idle timeout");
                }
            }
            return;
        }
    }
}

/// Drive one tunnel connection to completion. Returns once the connection is
/// torn down; the socket is dropped on return.
pub async fn run_tunnel<S: FrameSocket>(mut socket: S, ctx: TunnelContext) {
    let (outbox_tx, mut outbox_rx) = mpsc::channel(256);
    let tunnel = Tunnel::new(outbox_tx, ctx.settings.clone());

    let challenge = nonce::generate();
    let hello = ServerFrame::Challenge {
        nonce: challenge.clone(),
    };
    if socket.send_text(hello.to_text()).await.is_err() {
        return;
    }

    if !await_auth(&mut socket, &tunnel, &ctx, &challenge).await {
        return;
    }

    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + ctx.settings.keepalive_interval,
        ctx.settings.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = socket.next_event() => match event {
                SocketEvent::Text(text) => {
                    if text.len() > MAX_FRAME_BYTES {
                        debug!(tunnel = %tunnel.id(), bytes = text.len(), "dropping oversized frame");
                        continue;
                    }
                    match ClientFrame::from_text(&text) {
                        Ok(frame) => {
                            if handle_frame(&mut socket, &tunnel, &ctx, frame).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => debug!(tunnel = %tunnel.id(), %err, "dropping malformed frame"),
                    }
                }
                SocketEvent::Other => {}
                SocketEvent::Closed => break,
            },
            queued = outbox_rx.recv() => match queued {
                Some(frame) => {
                    if socket.send_text(frame.to_text()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = keepalive.tick() => {
                if tunnel.unanswered_pings.load(Ordering::SeqCst) >= MAX_UNANSWERED_PINGS {
                    info!(tunnel = %tunnel.id(), "keepalive timeout");
                    socket.close(CLOSE_KEEPALIVE, "keepalive timeout").await;
                    break;
                }
                tunnel.unanswered_pings.fetch_add(1, Ordering::SeqCst);
                let ping = ServerFrame::Ping { ts: unix_now() as u64 };
                if socket.send_text(ping.to_text()).await.is_err() {
                    break;
                }
            }
        }
    }

    tunnel.teardown(&ctx.registry);
}

/// Run the strict pre-auth phase. Returns `true` once the tunnel is
/// authenticated and registered; on any deviation the socket is closed and
/// `false` is returned with no registry change.
async fn await_auth<S: FrameSocket>(
    socket: &mut S,
    tunnel: &Arc<Tunnel>,
    ctx: &TunnelContext,
    challenge: &str,
) -> bool {
    let frame = tokio::select! {
        event = socket.next_event() => match event {
            SocketEvent::Text(text) if text.len() <= MAX_AUTH_FRAME_BYTES => {
                match ClientFrame::from_text(&text) {
                    Ok(frame) => frame,
                    Err(_) => {
                        return reject_auth(socket, "malformed_frame", CLOSE_MALFORMED).await;
                    }
                }
            }
            SocketEvent::Text(_) | SocketEvent::Other => {
                return reject_auth(socket, "malformed_frame", CLOSE_MALFORMED).await;
            }
            SocketEvent::Closed => return false,
        },
        _ = tokio::time::sleep(ctx.settings.auth_timeout) => {
            return reject_auth(socket, "auth_timeout", CLOSE_AUTH_FAILED).await;
        }
    };

    let ClientFrame::Auth {
        agents,
        nonce,
        timestamp,
    } = frame
    else {
        return reject_auth(socket, "malformed_frame", CLOSE_MALFORMED).await;
    };

    if nonce != challenge {
        return reject_auth(socket, "invalid_nonce", CLOSE_AUTH_FAILED).await;
    }
    if agents.len() > ctx.settings.max_agents {
        return reject_auth(socket, "too_many_agents", CLOSE_MALFORMED).await;
    }

    let verified = match verify_all(&agents, &nonce, timestamp, unix_now()) {
        Ok(verified) => verified,
        Err(failure) => {
            warn!(address = %failure.address, reason = failure.reason, "auth verification failed");
            return reject_auth(socket, failure.reason, CLOSE_AUTH_FAILED).await;
        }
    };

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    let mut seen = HashSet::new();
    for address in verified {
        if !seen.insert(address.clone()) {
            continue;
        }
        if ctx.registry.register(tunnel, address.clone()) {
            accepted.push(AgentEndpoint {
                url: address.url(&ctx.base_domain),
                address: address.to_string(),
            });
        } else {
            rejected.push(RejectedAgent {
                address: address.to_string(),
                reason: "already_registered".to_string(),
            });
        }
    }

    ctx.registry.attach(tunnel);
    info!(
        tunnel = %tunnel.id(),
        accepted = accepted.len(),
        rejected = rejected.len(),
        "tunnel authenticated"
    );

    let auth_ok = ServerFrame::AuthOk {
        agents: accepted,
        rejected: if rejected.is_empty() {
            None
        } else {
            Some(rejected)
        },
    };
    if socket.send_text(auth_ok.to_text()).await.is_err() {
        tunnel.teardown(&ctx.registry);
        return false;
    }
    true
}

async fn reject_auth<S: FrameSocket>(socket: &mut S, reason: &str, code: u16) -> bool {
    let frame = ServerFrame::AuthError {
        error: reason.to_string(),
    };
    let _ = socket.send_text(frame.to_text()).await;
    socket.close(code, reason).await;
    false
}

/// Dispatch one authenticated frame. `Err` means the socket failed and the
/// driver should tear down.
async fn handle_frame<S: FrameSocket>(
    socket: &mut S,
    tunnel: &Arc<Tunnel>,
    ctx: &TunnelContext,
    frame: ClientFrame,
) -> Result<(), SocketError> {
    match frame {
        ClientFrame::Pong { .. } => {
            tunnel.unanswered_pings.store(0, Ordering::SeqCst);
            Ok(())
        }
        ClientFrame::Response {
            id,
            status,
            headers,
            body,
        } => {
            tunnel.complete_buffered(&id, status, headers, body);
            Ok(())
        }
        ClientFrame::StreamStart {
            id,
            status,
            headers,
        } => {
            start_stream(tunnel, &id, status, headers);
            Ok(())
        }
        ClientFrame::StreamChunk { id, data } => {
            tunnel.push_chunk(&id, data);
            Ok(())
        }
        ClientFrame::StreamEnd { id } => {
            tunnel.finish_stream(&id);
            Ok(())
        }
        ClientFrame::RequestChallenge => {
            let fresh = nonce::generate();
            *tunnel.pending_nonce.lock().unwrap() = Some(PendingNonce {
                nonce: fresh.clone(),
                expires_at: Instant::now() + ctx.settings.nonce_ttl,
            });
            socket
                .send_text(ServerFrame::Challenge { nonce: fresh }.to_text())
                .await
        }
        ClientFrame::AddAgent {
            address,
            signature,
            nonce,
            timestamp,
        } => handle_add_agent(socket, tunnel, ctx, address, signature, nonce, timestamp).await,
        ClientFrame::RemoveAgent { address } => {
            let Ok(address) = AgentAddress::parse(&address) else {
                return Ok(());
            };
            if !tunnel.owns(&address) {
                return Ok(());
            }
            ctx.registry.unregister(tunnel, &address);
            socket
                .send_text(
                    ServerFrame::AgentRemoved {
                        address: address.to_string(),
                    }
                    .to_text(),
                )
                .await
        }
        ClientFrame::Auth { .. } => {
            debug!(tunnel = %tunnel.id(), "auth frame on authenticated tunnel, dropping");
            Ok(())
        }
    }
}

async fn handle_add_agent<S: FrameSocket>(
    socket: &mut S,
    tunnel: &Arc<Tunnel>,
    ctx: &TunnelContext,
    address: String,
    signature: String,
    nonce: String,
    timestamp: i64,
) -> Result<(), SocketError> {
    // Nonce must match the outstanding challenge and still be live.
    enum NonceCheck {
        Invalid,
        MaxAgents,
        Ok,
    }
    let check = {
        let mut slot = tunnel.pending_nonce.lock().unwrap();
        let live = matches!(
            slot.as_ref(),
            Some(pending) if pending.expires_at > Instant::now() && pending.nonce == nonce
        );
        if !live {
            if matches!(slot.as_ref(), Some(p) if p.expires_at <= Instant::now()) {
                *slot = None;
            }
            NonceCheck::Invalid
        } else if tunnel.agent_count() >= ctx.settings.max_agents {
            // The address cap is checked before the nonce is consumed: no
            // verification happens on this path, so the challenge stays valid.
            NonceCheck::MaxAgents
        } else {
            *slot = None;
            NonceCheck::Ok
        }
    };
    match check {
        NonceCheck::Invalid => return send_error(socket, "invalid_nonce").await,
        NonceCheck::MaxAgents => return send_error(socket, "max_agents_reached").await,
        NonceCheck::Ok => {}
    }

    let verified = match verify_agent(&address, &signature, &nonce, timestamp, unix_now()) {
        Ok(verified) => verified,
        Err(failure) => {
            warn!(tunnel = %tunnel.id(), address = %failure.address, "add_agent verification failed");
            return send_error(socket, "invalid_signature").await;
        }
    };

    if !ctx.registry.register(tunnel, verified.clone()) {
        return send_error(socket, "address_already_registered").await;
    }

    info!(tunnel = %tunnel.id(), address = %verified, "agent added");
    socket
        .send_text(
            ServerFrame::AgentAdded {
                url: verified.url(&ctx.base_domain),
                address: verified.to_string(),
            }
            .to_text(),
        )
        .await
}

async fn send_error<S: FrameSocket>(socket: &mut S, error: &str) -> Result<(), SocketError> {
    socket
        .send_text(
            ServerFrame::Error {
                error: error.to_string(),
            }
            .to_text(),
        )
        .await
}

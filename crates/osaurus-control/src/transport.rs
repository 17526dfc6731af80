//! Framed socket abstraction
//!
//! The tunnel driver is generic over the message channel so it can run on an
//! upgraded WebSocket in production and on an in-memory pair in tests. The
//! relay's protocol only uses text frames; transport-level control frames are
//! surfaced as [`SocketEvent::Other`] and never carry meaning.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// One observable event on a framed socket.
#[derive(Debug)]
pub enum SocketEvent {
    /// A text frame arrived.
    Text(String),
    /// A non-text frame arrived (binary and the like).
    Other,
    /// The peer closed the channel or the transport failed.
    Closed,
}

/// A send on a closed or failed socket.
#[derive(Debug, Error)]
#[error("socket send failed: {0}")]
pub struct SocketError(pub String);

/// A bidirectional text-frame channel.
#[async_trait]
pub trait FrameSocket: Send + 'static {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError>;
    async fn next_event(&mut self) -> SocketEvent;
    async fn close(&mut self, code: u16, reason: &str);
}

/// A raw frame on an in-memory socket.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// One half of an in-memory socket pair.
pub struct MemorySocket {
    tx: mpsc::Sender<MemoryFrame>,
    rx: mpsc::Receiver<MemoryFrame>,
}

/// Build a connected in-memory socket pair for exercising a tunnel without a
/// network.
pub fn memory_pair(capacity: usize) -> (MemorySocket, MemorySocket) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        MemorySocket { tx: a_tx, rx: b_rx },
        MemorySocket { tx: b_tx, rx: a_rx },
    )
}

impl MemorySocket {
    /// Receive the next raw frame, close frames included. `None` when the
    /// peer is gone.
    pub async fn recv_raw(&mut self) -> Option<MemoryFrame> {
        self.rx.recv().await
    }

    /// Send one raw frame to the peer.
    pub async fn send_raw(&mut self, frame: MemoryFrame) -> Result<(), SocketError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| SocketError("peer dropped".to_string()))
    }
}

#[async_trait]
impl FrameSocket for MemorySocket {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError> {
        self.send_raw(MemoryFrame::Text(text)).await
    }

    async fn next_event(&mut self) -> SocketEvent {
        match self.rx.recv().await {
            Some(MemoryFrame::Text(text)) => SocketEvent::Text(text),
            Some(MemoryFrame::Close { .. }) | None => SocketEvent::Closed,
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let _ = self
            .send_raw(MemoryFrame::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }
}

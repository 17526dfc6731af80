//! WebSocket transport adapter
//!
//! Bridges an upgraded axum WebSocket onto the control plane's `FrameSocket`
//! seam. Transport-level ping/pong frames are consumed here; only text and
//! binary frames are surfaced to the tunnel driver.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use osaurus_control::transport::{FrameSocket, SocketError, SocketEvent};

/// `FrameSocket` over an upgraded WebSocket.
pub struct WsFrameSocket {
    socket: WebSocket,
}

impl WsFrameSocket {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl FrameSocket for WsFrameSocket {
    async fn send_text(&mut self, text: String) -> Result<(), SocketError> {
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|err| SocketError(err.to_string()))
    }

    async fn next_event(&mut self) -> SocketEvent {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return SocketEvent::Text(text),
                Some(Ok(Message::Binary(_))) => return SocketEvent::Other,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return SocketEvent::Closed,
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.socket.send(Message::Close(Some(frame))).await;
    }
}

//! Tunnel wire frames
//!
//! Every frame is one JSON text message on the WebSocket, tagged by `type`.
//! The relay silently drops anything it cannot parse once a tunnel is
//! authenticated; before authentication a malformed frame is fatal.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One address/signature pair inside an `auth` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentCredential {
    pub address: String,
    pub signature: String,
}

/// An accepted address and its public URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentEndpoint {
    pub address: String,
    pub url: String,
}

/// An address refused during the initial auth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedAgent {
    pub address: String,
    pub reason: String,
}

/// Frames sent relay → agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Challenge {
        nonce: String,
    },
    AuthOk {
        agents: Vec<AgentEndpoint>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rejected: Option<Vec<RejectedAgent>>,
    },
    AuthError {
        error: String,
    },
    Ping {
        ts: u64,
    },
    Request {
        id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: String,
    },
    AgentAdded {
        address: String,
        url: String,
    },
    AgentRemoved {
        address: String,
    },
    Error {
        error: String,
    },
}

/// Frames sent agent runtime → relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        agents: Vec<AgentCredential>,
        nonce: String,
        timestamp: i64,
    },
    AddAgent {
        address: String,
        signature: String,
        nonce: String,
        timestamp: i64,
    },
    RemoveAgent {
        address: String,
    },
    RequestChallenge,
    Pong {
        ts: u64,
    },
    Response {
        id: String,
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: String,
    },
    StreamStart {
        id: String,
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    StreamChunk {
        id: String,
        data: String,
    },
    StreamEnd {
        id: String,
    },
}

impl ServerFrame {
    /// Serialize to the JSON text carried on the socket.
    ///
    /// Frames are plain data, so serialization cannot fail.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("server frames are always serializable")
    }
}

impl ClientFrame {
    /// Parse one inbound text frame.
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

//! Wire protocol for the osaurus agent relay
//!
//! Defines the canonical agent address type, the JSON text frames exchanged
//! over a tunnel, and the protocol-wide limits and timing constants.

pub mod address;
pub mod messages;

pub use address::{AddressError, AgentAddress};
pub use messages::{AgentCredential, AgentEndpoint, ClientFrame, RejectedAgent, ServerFrame};

use std::time::Duration;

/// Maximum number of addresses a single tunnel may hold.
pub const MAX_AGENTS_PER_TUNNEL: usize = 50;

/// Size cap for the single pre-auth frame. An `auth` frame carrying the full
/// agent cap is a few kilobytes, so anything near this limit is hostile.
pub const MAX_AUTH_FRAME_BYTES: usize = 1024 * 1024;

/// Size cap for frames on an authenticated tunnel. Response bodies ride
/// inside frames, so this is deliberately generous.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Inbound request bodies larger than this are refused with 413.
pub const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// How long a freshly opened socket may take to authenticate.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between keepalive pings on an authenticated tunnel.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Unanswered pings tolerated before the tunnel is torn down.
pub const MAX_UNANSWERED_PINGS: u32 = 3;

/// Deadline for the agent's first reply to a relayed request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle deadline between chunks of a streaming response.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifetime of an add-agent challenge nonce.
pub const NONCE_TTL: Duration = Duration::from_secs(30);

/// Tolerated clock skew on signed timestamps, in seconds.
pub const SIGNATURE_WINDOW_SECS: i64 = 30;

/// Close code for a malformed handshake.
pub const CLOSE_MALFORMED: u16 = 4000;
/// Close code for a failed signature or an auth-phase timeout.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Close code for a keepalive timeout.
pub const CLOSE_KEEPALIVE: u16 = 1000;

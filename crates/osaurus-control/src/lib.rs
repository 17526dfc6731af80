//! Control plane for the osaurus agent relay
//!
//! Owns the pieces between the HTTP ingress and the agent socket: the
//! address→tunnel registry, the per-connection tunnel state machine, the
//! request multiplexer, and the token-bucket rate limiters.

pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod transport;
pub mod tunnel;

pub use rate_limit::RateLimiter;
pub use registry::TunnelRegistry;
pub use relay::{submit, RelayRequest, RelayResponse};
pub use transport::{memory_pair, FrameSocket, MemoryFrame, MemorySocket, SocketError, SocketEvent};
pub use tunnel::{run_tunnel, StreamClosed, Tunnel, TunnelContext, TunnelReply, TunnelSettings};

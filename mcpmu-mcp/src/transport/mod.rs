//! Wire transports for downstream MCP servers
//!
//! Both transports surface the same shape to the client: a `send` side for
//! outbound JSON-RPC values and an event stream of inbound messages, stderr
//! lines (stdio only), and a terminal close notice. The client dispatches
//! responses by id and never needs to know which wire it is on.

pub mod http;
pub mod stdio;

pub use http::{AuthStatus, HttpTransport};
pub use stdio::StdioTransport;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::McpResult;

/// Inbound event from a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete JSON-RPC message from the peer
    Message(Value),

    /// One stderr line from a stdio child
    Stderr(String),

    /// The transport terminated; no further events follow
    Closed {
        /// Child exit code, when the transport was a process
        code: Option<i32>,
        /// Terminating signal, when the child died to one
        signal: Option<i32>,
        /// Human-readable cause when neither code nor signal applies
        message: Option<String>,
    },
}

/// Outbound side of a transport. The event stream is handed out once at
/// construction time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one JSON-RPC message. Serialized internally so concurrent
    /// senders never interleave frames.
    async fn send(&self, message: Value) -> McpResult<()>;

    /// Tear the transport down. In-flight requests observe
    /// [`TransportEvent::Closed`].
    async fn close(&self) -> McpResult<()>;
}

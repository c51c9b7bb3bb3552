//! MCP protocol plumbing for the mcpmu gateway
//!
//! This crate owns everything that speaks the Model Context Protocol:
//!
//! - [`protocol`]: JSON-RPC 2.0 framing and the MCP message types
//! - [`transport`]: the stdio child-process transport and the
//!   streamable-HTTP transport, both surfacing a uniform event stream
//! - [`client`]: the downstream protocol state machine (initialize
//!   handshake, `tools/list`, `tools/call`, notifications)
//! - [`server`]: the upstream stdio facade that presents the aggregate of
//!   all downstreams as one MCP server, including the `mcpmu.` manager
//!   tools
//!
//! The supervisor in `mcpmu-runtime` wires these pieces together; nothing
//! here retries or supervises; transports fail fast and the client reports
//! exactly what the downstream said.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ClientState, CloseReason, McpClient};
pub use error::{McpError, McpResult};
pub use protocol::{JsonRpcError, JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse, Tool};
pub use server::{GatewayHandler, GatewayServer, RouterError, MANAGER_TOOL_PREFIX};
pub use transport::{AuthStatus, Transport, TransportEvent};

/// MCP protocol version spoken toward downstreams and advertised upstream
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

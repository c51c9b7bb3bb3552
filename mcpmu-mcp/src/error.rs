//! Error types for MCP operations

use std::time::Duration;
use thiserror::Error;

/// Result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;

/// Errors from transports, the client state machine, and the facade
#[derive(Error, Debug)]
pub enum McpError {
    /// The transport terminated while requests were in flight
    #[error("transport closed: {message}")]
    TransportClosed { message: String },

    /// The caller cancelled or the deadline elapsed
    #[error("operation cancelled")]
    Cancelled,

    /// The downstream did not complete `initialize` in time
    #[error("startup timed out after {timeout:?}")]
    StartupTimeout { timeout: Duration },

    /// The peer violated the protocol (bad handshake, wrong payload shape)
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// A stdio line was not a complete JSON object
    #[error("framing error: {details}")]
    Framing { details: String },

    /// A JSON-RPC error object from the peer, passed through untransformed
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// HTTP downstream demands authentication we cannot satisfy
    #[error("authentication required")]
    NeedsLogin,

    /// Operation issued in a state that does not accept it
    #[error("invalid client state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Serialization/deserialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Process or pipe IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP-level failure in the streamable-http transport
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl McpError {
    /// Create a transport-closed error
    pub fn transport_closed(message: impl Into<String>) -> Self {
        Self::TransportClosed {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a framing error
    pub fn framing(details: impl Into<String>) -> Self {
        Self::Framing {
            details: details.into(),
        }
    }
}

impl From<mcpmu_auth::AuthError> for McpError {
    fn from(err: mcpmu_auth::AuthError) -> Self {
        match err {
            mcpmu_auth::AuthError::NeedsLogin => McpError::NeedsLogin,
            other => McpError::Protocol {
                message: other.to_string(),
            },
        }
    }
}

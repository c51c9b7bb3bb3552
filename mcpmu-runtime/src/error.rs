//! Runtime error types

use thiserror::Error;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors from the supervisor, aggregator, and reload watcher
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The named server or namespace is unknown to the runtime
    #[error("not found: {0}")]
    NotFound(String),

    /// The server exists but is disabled in configuration
    #[error("server '{0}' is disabled")]
    Disabled(String),

    /// The target actor is gone (shutdown in progress)
    #[error("server '{0}' is shutting down")]
    ShuttingDown(String),

    /// Protocol or transport failure from the MCP layer
    #[error(transparent)]
    Mcp(#[from] mcpmu_mcp::McpError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] mcpmu_config::ConfigError),

    /// Credential or OAuth failure
    #[error(transparent)]
    Auth(#[from] mcpmu_auth::AuthError),

    /// Filesystem watcher failure
    #[error("config watcher error: {0}")]
    Watcher(String),

    /// Invariant violation; should be unreachable
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

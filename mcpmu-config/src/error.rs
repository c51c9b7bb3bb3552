//! Configuration error types

use thiserror::Error;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A server or namespace with this name already exists
    #[error("name already exists: {0}")]
    NameExists(String),

    /// The referenced server or namespace is not in the configuration
    #[error("not found: {0}")]
    NotFound(String),

    /// Empty name, or a name containing the qualification separator `.`
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// IO error reading or writing the configuration file
    #[error("config file IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Semantic validation failure on load or mutation
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

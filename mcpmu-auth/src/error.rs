//! Auth error types

use thiserror::Error;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors from credential storage and the OAuth flow
#[derive(Error, Debug)]
pub enum AuthError {
    /// No usable credentials; `mcp login` can recover
    #[error("authentication required: run `mcpmu mcp login`")]
    NeedsLogin,

    /// The interactive flow was denied, cancelled, or replied with a bad
    /// `state`
    #[error("authorization denied: {0}")]
    OAuthDenied(String),

    /// The server's OAuth metadata could not be located or parsed
    #[error("OAuth discovery failed: {0}")]
    Discovery(String),

    /// Dynamic client registration was rejected
    #[error("client registration failed: {0}")]
    Registration(String),

    /// The token endpoint rejected an exchange or refresh
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// HTTP-level failure talking to the authorization server
    #[error("OAuth HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// OS keychain failure
    #[error("keyring error: {0}")]
    Keyring(String),

    /// Encryption or decryption failure in the file store
    #[error("credential file crypto error: {0}")]
    Crypto(String),

    /// Filesystem failure in the file store
    #[error("credential store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed stored record or endpoint response
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed server URL or redirect URI
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The flow's deadline elapsed before the callback arrived
    #[error("authorization flow timed out")]
    Timeout,

    /// The caller cancelled the flow
    #[error("authorization flow cancelled")]
    Cancelled,
}

impl AuthError {
    /// Create a keyring error
    pub fn keyring(message: impl Into<String>) -> Self {
        Self::Keyring(message.into())
    }

    /// Create a crypto error
    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }
}

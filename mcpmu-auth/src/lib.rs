//! OAuth and credential storage for the mcpmu gateway
//!
//! Two concerns live here:
//!
//! - [`credentials`]: persistence of OAuth token records, keyed by server
//!   URL. Three backends: the OS keychain, an AEAD-encrypted file beside the
//!   config, and an auto mode that prefers the keychain and falls back to
//!   the file.
//! - [`oauth`]: the interactive authorization flow: metadata discovery,
//!   dynamic client registration, authorization-code + PKCE with a loopback
//!   callback, token exchange, and refresh.
//!
//! The HTTP transport consumes stored tokens and calls
//! [`oauth::refresh_token_record`] on 401; the CLI's `mcp login` runs the
//! full [`oauth::OAuthFlow`].

pub mod credentials;
pub mod error;
pub mod oauth;

pub use credentials::{open_store, AutoStore, CredentialStore, FileStore, KeyringStore, TokenRecord};
pub use error::{AuthError, AuthResult};
pub use oauth::{discover, refresh_token_record, AuthServerMetadata, FlowOptions, OAuthFlow};

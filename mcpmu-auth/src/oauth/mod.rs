//! Interactive OAuth authorization flow
//!
//! The flow follows the MCP authorization profile: discover the
//! authorization server's metadata, register a client dynamically when no
//! credentials are cached, run authorization-code + PKCE through the user's
//! browser with a loopback callback, exchange the code, and persist the
//! resulting [`TokenRecord`](crate::credentials::TokenRecord).

mod flow;
mod metadata;

pub use flow::{refresh_token_record, FlowOptions, OAuthFlow};
pub use metadata::{discover, AuthServerMetadata};

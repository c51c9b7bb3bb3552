//! MCP protocol implementation including JSON-RPC 2.0 and MCP-specific message types

pub mod jsonrpc;
pub mod messages;
pub mod methods;

pub use jsonrpc::{JsonRpcError, JsonRpcErrorCode, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
pub use messages::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, ServerCapabilities,
    ServerInfo, Tool, ToolContent, ToolsCallParams, ToolsCallResult, ToolsCapability,
    ToolsListResult,
};

/// Supported MCP protocol versions, newest preferred
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26"];

/// Pick the protocol version to answer a client's `initialize` with: echo a
/// known version, otherwise fall back to ours.
pub fn negotiate_protocol_version(client_version: &str) -> String {
    if SUPPORTED_PROTOCOL_VERSIONS.contains(&client_version) {
        client_version.to_string()
    } else {
        crate::MCP_PROTOCOL_VERSION.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_versions_are_echoed() {
        assert_eq!(negotiate_protocol_version("2024-11-05"), "2024-11-05");
        assert_eq!(negotiate_protocol_version("2025-03-26"), "2025-03-26");
    }

    #[test]
    fn unknown_versions_fall_back() {
        assert_eq!(negotiate_protocol_version("1999-01-01"), "2024-11-05");
    }
}

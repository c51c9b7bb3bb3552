//! MCP method and notification names

/// Initialize the connection
pub const INITIALIZE: &str = "initialize";

/// Client-side acknowledgement after `initialize`; some peers send the bare
/// legacy name
pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
pub const NOTIFICATION_INITIALIZED_LEGACY: &str = "initialized";

/// Connection-health probe
pub const PING: &str = "ping";

/// Tool discovery and invocation
pub const TOOLS_LIST: &str = "tools/list";
pub const TOOLS_CALL: &str = "tools/call";

/// The peer's tool list changed
pub const NOTIFICATION_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// Log message from the peer
pub const NOTIFICATION_MESSAGE: &str = "notifications/message";

/// Cancel an in-flight request by id
pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";

/// Whether a method name is the initialized notification (either spelling).
pub fn is_initialized_notification(method: &str) -> bool {
    method == NOTIFICATION_INITIALIZED || method == NOTIFICATION_INITIALIZED_LEGACY
}

//! Typed events carried by the bus

use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed downstream server.
///
/// The supervisor publishes a [`GatewayEvent::StatusChanged`] on every
/// transition; the current value is also readable from its status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Present in configuration but explicitly disabled
    Disabled,
    /// Enabled and idle
    Stopped,
    /// Transport spawned, initialize handshake in flight
    Starting,
    /// Handshake complete, accepting tool calls
    Running,
    /// Stop requested, waiting for the transport to wind down
    Stopping,
    /// Transport terminated unexpectedly or failed to start
    Crashed,
}

impl ServerState {
    /// Whether tool calls can be dispatched in this state
    pub fn is_running(&self) -> bool {
        matches!(self, ServerState::Running)
    }

    /// Whether a `Start` command is accepted in this state
    pub fn can_start(&self) -> bool {
        matches!(self, ServerState::Stopped | ServerState::Crashed)
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Disabled => "disabled",
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Event published on the gateway bus.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A supervised server changed lifecycle state
    StatusChanged {
        server: String,
        state: ServerState,
    },

    /// One stderr line from a stdio downstream
    LogReceived {
        server: String,
        line: String,
    },

    /// A downstream reported a fresh tool list
    ToolsUpdated {
        server: String,
        count: usize,
    },

    /// A non-fatal error attributable to one server, or to the gateway when
    /// `server` is `None`
    Error {
        server: Option<String>,
        message: String,
    },

    /// The configuration file was reloaded by the watcher
    ConfigReloaded,

    /// Synthesized locally for a lagging subscriber; never broadcast
    Overflow {
        missed: u64,
    },
}

impl GatewayEvent {
    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayEvent::StatusChanged { .. } => "status-changed",
            GatewayEvent::LogReceived { .. } => "log-received",
            GatewayEvent::ToolsUpdated { .. } => "tools-updated",
            GatewayEvent::Error { .. } => "error",
            GatewayEvent::ConfigReloaded => "config-reloaded",
            GatewayEvent::Overflow { .. } => "overflow",
        }
    }

    /// Server this event is about, if any
    pub fn server(&self) -> Option<&str> {
        match self {
            GatewayEvent::StatusChanged { server, .. }
            | GatewayEvent::LogReceived { server, .. }
            | GatewayEvent::ToolsUpdated { server, .. } => Some(server),
            GatewayEvent::Error { server, .. } => server.as_deref(),
            GatewayEvent::ConfigReloaded | GatewayEvent::Overflow { .. } => None,
        }
    }
}

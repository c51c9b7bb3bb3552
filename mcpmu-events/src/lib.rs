//! Event bus for mcpmu gateway lifecycle events
//!
//! Every long-lived component of the gateway (transports, clients, the
//! supervisor, the reload watcher) publishes typed events here. Subscribers
//! (the CLI status view, the server facade's `tools/list_changed` forwarding)
//! consume them without coupling to the producers.
//!
//! Delivery is best-effort: a subscriber that falls behind observes a single
//! [`GatewayEvent::Overflow`] marker for the missed span and then resumes with
//! the live stream.

pub mod bus;
pub mod event;

pub use bus::{BusError, EventBus, EventStream, DEFAULT_CHANNEL_CAPACITY};
pub use event::{GatewayEvent, ServerState};

//! Broadcast bus implementation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::event::GatewayEvent;

/// Default ring-buffer capacity per subscriber.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Errors surfaced by [`EventBus::publish`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    /// The bus was closed; no further publishes are accepted
    #[error("event bus is closed")]
    Closed,
}

/// Internal wire type so subscribers can observe an explicit end of stream
/// after draining buffered events.
#[derive(Debug, Clone)]
enum BusMessage {
    Event(GatewayEvent),
    Shutdown,
}

/// Multi-producer, multi-consumer broadcast of [`GatewayEvent`]s.
///
/// Cloning the bus is cheap and shares the underlying channel. Events from a
/// single producer reach every subscriber in publication order; a slow
/// subscriber drops events rather than blocking producers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusMessage>,
    closed: Arc<AtomicBool>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with an explicit per-subscriber buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers that will observe the event. A bus
    /// with no subscribers accepts the publish and returns zero.
    pub fn publish(&self, event: GatewayEvent) -> Result<usize, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        trace!(kind = event.kind(), server = ?event.server(), "publishing event");
        Ok(self.sender.send(BusMessage::Event(event)).unwrap_or(0))
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
        }
    }

    /// Close the bus: subsequent publishes fail, subscribers drain whatever
    /// is buffered and then observe end of stream.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.sender.send(BusMessage::Shutdown);
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription handle returned by [`EventBus::subscribe`].
///
/// Dropping the stream unsubscribes. A subscriber that cannot keep up
/// receives a single [`GatewayEvent::Overflow`] for the missed span.
pub struct EventStream {
    receiver: broadcast::Receiver<BusMessage>,
}

impl EventStream {
    /// Receive the next event, or `None` once the bus is closed and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        match self.receiver.recv().await {
            Ok(BusMessage::Event(event)) => Some(event),
            Ok(BusMessage::Shutdown) => None,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(GatewayEvent::Overflow { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking receive; `None` when no event is ready or the stream
    /// ended.
    pub fn try_recv(&mut self) -> Option<GatewayEvent> {
        match self.receiver.try_recv() {
            Ok(BusMessage::Event(event)) => Some(event),
            Ok(BusMessage::Shutdown) => None,
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(GatewayEvent::Overflow { missed })
            }
            Err(_) => None,
        }
    }
}

//! Typed publish/subscribe surface.
//!
//! The transport announces its lifecycle and undispatched inbound messages
//! on a broadcast bus. Topics form a closed enumeration with typed
//! payloads; server message types with no registered handler fall back to
//! the generic [`Event::Inbound`] variant so forward-compatible messages
//! still reach listeners.

use std::borrow::Cow;

use serde_json::Value;
use tokio::sync::broadcast;

/// Broadcast channel capacity for transport events.
const BUS_CAPACITY: usize = 1024;

/// Why the transport is asking the host for a full reload/resync.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadReason {
    /// Inbound sequence number jumped by more than one
    VersionGap,
    /// The server sent an explicit resync request
    ServerResync,
    /// The connection was torn down while idle and state is too stale to trust
    StaleAfterIdle,
}

/// Transport event, published in strict emission order to all subscribers.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Event {
    /// The socket opened
    Open,
    /// The socket closed or errored
    Close,
    /// First ever successful connection of this transport instance (one-shot)
    FirstConnect,
    /// The smoothed round-trip average changed
    Lag {
        /// Smoothed round-trip time in milliseconds
        average_ms: f64,
    },
    /// The host must perform a full state reload; the gap is never filled locally
    Reload {
        /// What made local recovery impossible
        reason: ReloadReason,
    },
    /// Inbound message claimed by neither the raw receiver nor a typed handler
    Inbound {
        /// Server message type
        msg_type: String,
        /// Payload, if any
        data: Option<Value>,
    },
}

impl Event {
    /// Derived topic name, `socket.in.<type>` for undispatched inbound.
    #[must_use]
    pub fn topic(&self) -> Cow<'static, str> {
        match self {
            Self::Open => Cow::Borrowed("socket.open"),
            Self::Close => Cow::Borrowed("socket.close"),
            Self::FirstConnect => Cow::Borrowed("socket.connect"),
            Self::Lag { .. } => Cow::Borrowed("socket.lag"),
            Self::Reload { .. } => Cow::Borrowed("socket.reload"),
            Self::Inbound { msg_type, .. } => Cow::Owned(format!("socket.in.{msg_type}")),
        }
    }
}

/// Handle to the transport's broadcast bus.
///
/// Cloning is cheap; every clone publishes to and subscribes from the same
/// channel. Delivery is ordered per subscriber and nothing is persisted:
/// a subscriber created after an event will never see it.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. Events published while nobody
    /// listens are dropped.
    pub fn publish(&self, event: Event) {
        _ = self.tx.send(event);
    }

    /// Subscribe to events from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

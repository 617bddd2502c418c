use std::fmt;
use std::sync::Weak;

use bytes::Bytes;

use crate::error::Result;

/// One complete message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Binary message. The only kind the frame layer accepts.
    Binary(Bytes),
    /// Text message. Reported upstream as an unsupported frame format.
    Text(String),
}

impl Message {
    /// Length of the message content in bytes.
    pub fn len(&self) -> usize {
        match self {
            Message::Binary(data) => data.len(),
            Message::Text(text) => text.len(),
        }
    }

    /// Returns true if the message carries no content.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle and data events reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established and ready for `send`.
    Open,
    /// The connection is gone.
    Close,
    /// The connection failed. Usually followed by `Close`.
    Error(String),
    /// A complete inbound message.
    Message(Message),
}

/// Receiver side of transport events.
///
/// `generation` identifies which connection attempt the event belongs to so
/// the receiver can discard events from a transport it has already replaced.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, generation: u64, event: TransportEvent);
}

/// Handle a transport uses to report events for one connection attempt.
///
/// Holds only a weak reference to the receiver: a transport thread that
/// outlives its client stops delivering instead of keeping the client alive.
#[derive(Clone)]
pub struct EventSink {
    handler: Weak<dyn EventHandler>,
    generation: u64,
}

impl EventSink {
    /// Create a sink bound to `handler` for connection attempt `generation`.
    pub fn new(handler: Weak<dyn EventHandler>, generation: u64) -> Self {
        Self {
            handler,
            generation,
        }
    }

    /// Connection attempt this sink reports for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns `false` once the receiver is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match self.handler.upgrade() {
            Some(handler) => {
                handler.handle_event(self.generation, event);
                true
            }
            None => false,
        }
    }

    pub fn open(&self) -> bool {
        self.emit(TransportEvent::Open)
    }

    pub fn close(&self) -> bool {
        self.emit(TransportEvent::Close)
    }

    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Error(reason.into()))
    }

    pub fn message(&self, message: Message) -> bool {
        self.emit(TransportEvent::Message(message))
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("generation", &self.generation)
            .field("attached", &(self.handler.strong_count() > 0))
            .finish()
    }
}

/// Write half of a connected transport.
///
/// Implementations must preserve send order on the wire and must not report
/// events synchronously from inside `send` or `close`; events are delivered
/// from the transport's own thread or from the peer side.
pub trait Transport: Send {
    /// Send one complete binary message.
    fn send(&mut self, data: Bytes) -> Result<()>;

    /// Close the connection. Idempotent.
    fn close(&mut self);
}

/// Opens transports.
///
/// `connect` must not report events synchronously either: the `Open` event
/// for the returned transport arrives later through `events`.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str, events: EventSink) -> Result<Box<dyn Transport>>;
}

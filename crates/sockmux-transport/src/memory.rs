//! In-process transport.
//!
//! [`memory_pair`] returns a [`MemoryConnector`] for the client side and a
//! [`MemoryAcceptor`] that hands out one [`ServerEnd`] per connection attempt.
//! The server end decides when the connection opens, what the client
//! receives, and when it closes, which makes it suitable for driving the
//! connection state machine step by step.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{Connector, EventSink, Message, Transport};

/// Create a connected connector/acceptor pair.
pub fn memory_pair() -> (MemoryConnector, MemoryAcceptor) {
    let (tx, rx) = mpsc::channel();
    let refuse = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(AtomicUsize::new(0));
    (
        MemoryConnector {
            accepted: Mutex::new(tx),
            refuse: Arc::clone(&refuse),
            attempts: Arc::clone(&attempts),
        },
        MemoryAcceptor {
            incoming: rx,
            refuse,
            attempts,
        },
    )
}

/// Client-side connector for the in-process transport.
pub struct MemoryConnector {
    accepted: Mutex<Sender<ServerEnd>>,
    refuse: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &str, events: EventSink) -> Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!(url, "memory connector refusing connection");
            return Err(TransportError::Connect {
                url: url.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }

        let (tx, rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let server = ServerEnd {
            url: url.to_string(),
            events,
            inbound: rx,
            closed: Arc::clone(&closed),
        };

        let accepted = self.accepted.lock().map_err(|_| TransportError::Closed)?;
        accepted.send(server).map_err(|_| TransportError::Closed)?;

        Ok(Box::new(MemoryTransport {
            outbound: tx,
            closed,
        }))
    }
}

/// Server side of the in-process transport: receives each connection attempt.
pub struct MemoryAcceptor {
    incoming: Receiver<ServerEnd>,
    refuse: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryAcceptor {
    /// Next pending connection attempt, if any.
    pub fn try_accept(&self) -> Option<ServerEnd> {
        self.incoming.try_recv().ok()
    }

    /// Wait up to `timeout` for the next connection attempt.
    pub fn accept_timeout(&self, timeout: Duration) -> Option<ServerEnd> {
        self.incoming.recv_timeout(timeout).ok()
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Number of connection attempts observed so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

struct MemoryTransport {
    outbound: Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

impl Transport for MemoryTransport {
    fn send(&mut self, data: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.outbound.send(data).map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Scriptable peer of one in-process connection.
///
/// Every event method runs the client's handler on the calling thread.
pub struct ServerEnd {
    url: String,
    events: EventSink,
    inbound: Receiver<Bytes>,
    closed: Arc<AtomicBool>,
}

impl ServerEnd {
    /// URL the client connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connection attempt this end belongs to.
    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn open(&self) {
        self.events.open();
    }

    /// Deliver a binary message to the client.
    pub fn send(&self, data: impl Into<Bytes>) {
        self.events.message(Message::Binary(data.into()));
    }

    /// Deliver a text message to the client.
    pub fn send_text(&self, text: impl Into<String>) {
        self.events.message(Message::Text(text.into()));
    }

    /// Report an error to the client. The connection is marked closed.
    pub fn error(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.error(reason);
    }

    /// Close the connection from the server side.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.close();
    }

    /// Next message the client sent, if one is queued.
    pub fn try_recv(&self) -> Option<Bytes> {
        match self.inbound.try_recv() {
            Ok(data) => Some(data),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next message the client sent.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Bytes> {
        match self.inbound.recv_timeout(timeout) {
            Ok(data) => Some(data),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Returns true once either side has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ServerEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEnd")
            .field("url", &self.url)
            .field("generation", &self.events.generation())
            .field("closed", &self.is_closed())
            .finish()
    }
}

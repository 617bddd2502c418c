//! Message-oriented transport boundary for sockmux.
//!
//! A transport is anything that, once connected, delivers whole messages in
//! order and reports `open`, `close`, `error` and `message` events. The client
//! layers above never touch sockets directly; they go through the
//! [`Connector`] and [`Transport`] traits defined here.
//!
//! Two implementations ship with the crate:
//! - [`memory`]: an in-process transport with a scriptable server end
//! - [`uds`]: Unix domain sockets carrying length-delimited messages

pub mod error;
pub mod memory;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use memory::{memory_pair, MemoryAcceptor, MemoryConnector, ServerEnd};
pub use traits::{Connector, EventHandler, EventSink, Message, Transport, TransportEvent};

#[cfg(unix)]
pub use uds::UdsConnector;

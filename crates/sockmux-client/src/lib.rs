//! Client side of the sockmux protocol.
//!
//! A [`Client`] owns one logical connection. Calls made with
//! [`Client::send`] are framed, written to the transport, and correlated
//! with their responses by operator code and sequence number. When the
//! transport closes or fails, the client reconnects on its own with linear
//! backoff.
//!
//! Responses are delivered through [`Callback`] hooks; connection
//! transitions through [`Lifecycle`] hooks. Neither runs while the client
//! holds an internal lock, so hooks may call back into the client.

pub mod callback;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod mux;
pub mod scheduler;
pub mod sequence;

pub use callback::{
    Callback, Lifecycle, CALL_TIMEOUT_CODE, INVALID_BODY_CODE, UNKNOWN_ERROR_CODE,
};
pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::ConnectionState;
pub use error::{ClientError, Result, ScheduleError};
pub use mux::CorrelationKey;
pub use scheduler::{ManualScheduler, Scheduler, Task, ThreadScheduler, TimerId};
pub use sequence::{Clock, SequenceGenerator, SystemClock};

#[cfg(feature = "async")]
pub use scheduler::TokioScheduler;

//! Multiplexed request/response client over a framed, persistent socket.
//!
//! One connection carries many concurrent calls. Each call is framed with
//! an operator code and a sequence number, and the response carrying the
//! same pair is routed back to the call's hooks. When the connection drops
//! the client reconnects with linear backoff.
//!
//! # Crate Structure
//!
//! - [`transport`] — Transport boundary, in-process and Unix socket transports
//! - [`frame`] — Packet codec, header table, operator hashing
//! - [`client`] — Request multiplexer, connection manager, [`Client`]
//! - [`logging`] — `tracing-subscriber` setup (behind `logging` feature)

/// Re-export transport types.
pub mod transport {
    pub use sockmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use sockmux_frame::*;
}

/// Re-export client types.
pub mod client {
    pub use sockmux_client::*;
}

#[cfg(feature = "logging")]
pub mod logging;

pub use sockmux_client::{Callback, Client, ClientConfig, ClientError, Lifecycle, ReconnectPolicy};

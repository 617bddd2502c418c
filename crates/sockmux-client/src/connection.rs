//! Connection state machine.
//!
//! # State Machine
//!
//! ```text
//!              transport open
//! ┌────────────┐ ─────────────> ┌──────┐
//! │ Connecting │                │ Open │
//! └────────────┘ <──┐           └──────┘
//!       │           │ retry        │
//!       │ close /   │ (after       │ close / error
//!       │ error     │  backoff)    │
//!       ↓           │              ↓
//!     ┌─────────────┴──────────────────┐
//!     │             Closed             │
//!     └────────────────────────────────┘
//! ```
//!
//! Like the rest of the core this is pure logic: methods mutate state and
//! return [`ConnectionAction`]s for the client to execute once its lock is
//! released. The only I/O performed here is writing to and closing the
//! transport handle the manager owns.
//!
//! Every connection attempt gets a new generation number. Events tagged
//! with an older generation come from a transport that has already been
//! replaced and are ignored. Scheduled retries carry the generation they
//! were scheduled under and are ignored the same way once it has passed.

use std::time::Duration;

use bytes::Bytes;
use sockmux_transport::Transport;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// An attempt is in progress; the transport has not reported `open` yet.
    Connecting,
    /// The transport is open and accepts frames.
    Open,
    /// No usable transport.
    Closed,
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectionAction {
    NotifyOpen,
    NotifyClose,
    NotifyError(String),
    /// Run [`ConnectionManager::start_reconnect_attempt`] with `generation`
    /// after `delay`.
    ScheduleReconnect { delay: Duration, generation: u64 },
}

pub(crate) struct ConnectionManager {
    state: ConnectionState,
    reconnect_attempts: u32,
    reconnect_in_flight: bool,
    generation: u64,
    transport: Option<Box<dyn Transport>>,
    policy: ReconnectPolicy,
    /// Set by `disconnect`; suppresses reconnection until `resume`.
    manual_close: bool,
}

impl ConnectionManager {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Closed,
            reconnect_attempts: 0,
            reconnect_in_flight: false,
            generation: 0,
            transport: None,
            policy,
            manual_close: false,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub(crate) fn reconnect_in_flight(&self) -> bool {
        self.reconnect_in_flight
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Start a new attempt: drop any previous transport and enter `Connecting`.
    ///
    /// Returns the generation the new transport must report under.
    /// A retry scheduled before this call is superseded.
    pub(crate) fn begin_attempt(&mut self) -> u64 {
        self.release_transport();
        self.reconnect_in_flight = false;
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        debug!(generation = self.generation, "connection attempt started");
        self.generation
    }

    /// Store the transport returned by the connector.
    pub(crate) fn attach(&mut self, generation: u64, mut transport: Box<dyn Transport>) {
        if !self.is_current(generation) || self.manual_close {
            debug!(generation, "discarding transport from superseded attempt");
            transport.close();
            return;
        }
        self.transport = Some(transport);
    }

    pub(crate) fn on_open(&mut self, generation: u64) -> Vec<ConnectionAction> {
        if !self.is_current(generation) {
            debug!(generation, "ignoring open from stale transport");
            return Vec::new();
        }
        info!(
            generation,
            attempts = self.reconnect_attempts,
            "connection open"
        );
        self.state = ConnectionState::Open;
        self.reconnect_attempts = 0;
        vec![ConnectionAction::NotifyOpen]
    }

    pub(crate) fn on_close(&mut self, generation: u64) -> Vec<ConnectionAction> {
        if !self.is_current(generation) {
            debug!(generation, "ignoring close from stale transport");
            return Vec::new();
        }
        info!(generation, "connection closed");
        self.enter_closed();
        let mut actions = vec![ConnectionAction::NotifyClose];
        actions.extend(self.reconnect());
        actions
    }

    pub(crate) fn on_error(&mut self, generation: u64, reason: &str) -> Vec<ConnectionAction> {
        if !self.is_current(generation) {
            debug!(generation, "ignoring error from stale transport");
            return Vec::new();
        }
        warn!(generation, reason, "connection error");
        self.enter_closed();
        let mut actions = vec![ConnectionAction::NotifyError(reason.to_string())];
        actions.extend(self.reconnect());
        actions
    }

    fn enter_closed(&mut self) {
        self.state = ConnectionState::Closed;
        self.release_transport();
    }

    fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }

    /// Schedule the next attempt unless one is already pending.
    fn reconnect(&mut self) -> Option<ConnectionAction> {
        if self.manual_close || !self.policy.enabled {
            return None;
        }
        if self.reconnect_in_flight {
            debug!("reconnect already scheduled");
            return None;
        }
        self.reconnect_in_flight = true;
        let delay = self.policy.delay_for(self.reconnect_attempts);
        info!(
            attempt = self.reconnect_attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        Some(ConnectionAction::ScheduleReconnect {
            delay,
            generation: self.generation,
        })
    }

    /// Called when a scheduled reconnect fires.
    ///
    /// Counts the attempt and clears the in-flight flag as soon as the
    /// attempt is issued, so a failure of this attempt can schedule the next
    /// one. Returns the new generation, or `None` if the retry was scheduled
    /// under an older generation, the client was closed in the meantime, or
    /// another attempt is already running.
    pub(crate) fn start_reconnect_attempt(&mut self, scheduled_at: u64) -> Option<u64> {
        if !self.is_current(scheduled_at) {
            debug!(
                scheduled_at,
                generation = self.generation,
                "ignoring superseded reconnect timer"
            );
            return None;
        }
        self.reconnect_in_flight = false;
        if self.manual_close || self.state != ConnectionState::Closed {
            return None;
        }
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        Some(self.begin_attempt())
    }

    /// The retry scheduled under `generation` could not be armed.
    ///
    /// Clears the in-flight flag so the next close or error schedules again.
    pub(crate) fn reconnect_unscheduled(&mut self, generation: u64) {
        if self.is_current(generation) {
            self.reconnect_in_flight = false;
        }
    }

    /// Write a frame if the connection is open.
    ///
    /// Refusals are logged, not returned: the state may legitimately have
    /// changed since the caller checked it.
    pub(crate) fn send(&mut self, frame: Bytes) -> bool {
        if self.state != ConnectionState::Open {
            warn!(state = ?self.state, "dropping frame: connection not open");
            return false;
        }
        let Some(transport) = self.transport.as_mut() else {
            warn!("dropping frame: no transport attached");
            return false;
        };
        match transport.send(frame) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "dropping frame: transport send failed");
                false
            }
        }
    }

    /// Application-initiated close. No reconnect follows.
    pub(crate) fn disconnect(&mut self) -> Vec<ConnectionAction> {
        self.manual_close = true;
        self.reconnect_in_flight = false;
        let was = self.state;
        self.enter_closed();
        // Events from the transport we just closed are now stale.
        self.generation += 1;
        if was == ConnectionState::Closed {
            Vec::new()
        } else {
            vec![ConnectionAction::NotifyClose]
        }
    }

    /// Re-allow reconnection after `disconnect`.
    pub(crate) fn resume(&mut self) {
        self.manual_close = false;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.release_transport();
    }
}

//! Request multiplexer: correlates inbound packets with outstanding calls.
//!
//! Two kinds of registrations share one dispatch path:
//! - one-shot calls, keyed by `(operator code, sequence)`, removed on their
//!   first matching response
//! - persistent listeners, keyed by operator code alone, kept until removed
//!
//! An inbound packet is matched against the one-shot table first and the
//! listener table second. Packets that match neither are dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use sockmux_frame::{
    encode_packet, FrameConfig, HeaderTable, OperatorHasher, Packet, CODE_KEY, MESSAGE_KEY,
    PING_OPERATOR,
};
use tracing::{debug, warn};

use crate::callback::{Callback, Delivery, Outcome, INVALID_BODY_CODE, UNKNOWN_ERROR_CODE};
use crate::error::{ClientError, Result};
use crate::scheduler::TimerId;
use crate::sequence::SequenceGenerator;

/// Identifies one outstanding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey {
    pub operator: u32,
    pub sequence: i64,
}

impl CorrelationKey {
    pub fn new(operator: u32, sequence: i64) -> Self {
        Self { operator, sequence }
    }

    /// Key a packet answers to.
    pub fn of(packet: &Packet) -> Self {
        Self::new(packet.operator, packet.sequence)
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}/{}", self.operator, self.sequence)
    }
}

/// A registered call, encoded and ready to write.
#[derive(Debug)]
pub(crate) struct PreparedCall {
    pub(crate) key: CorrelationKey,
    pub(crate) frame: Bytes,
    pub(crate) callback: Callback,
}

/// An outstanding one-shot call and the timer that will expire it.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub(crate) callback: Callback,
    pub(crate) timer: Option<TimerId>,
}

/// A matched packet. `timer` belonged to the answered call and is no
/// longer needed.
#[derive(Debug)]
pub(crate) struct Dispatched {
    pub(crate) delivery: Delivery,
    pub(crate) timer: Option<TimerId>,
}

pub(crate) struct Multiplexer {
    pending: HashMap<CorrelationKey, PendingCall>,
    listeners: HashMap<u32, Callback>,
    request_header: HeaderTable,
    response_header: HeaderTable,
    hasher: Arc<dyn OperatorHasher>,
    sequences: SequenceGenerator,
    frame: FrameConfig,
}

impl Multiplexer {
    pub(crate) fn new(
        hasher: Arc<dyn OperatorHasher>,
        sequences: SequenceGenerator,
        frame: FrameConfig,
    ) -> Self {
        Self {
            pending: HashMap::new(),
            listeners: HashMap::new(),
            request_header: HeaderTable::new(),
            response_header: HeaderTable::new(),
            hasher,
            sequences,
            frame,
        }
    }

    pub(crate) fn operator_code(&self, name: &str) -> u32 {
        self.hasher.hash(name)
    }

    /// Register a one-shot call and encode its frame.
    ///
    /// Nothing is registered if encoding fails.
    pub(crate) fn register_call(
        &mut self,
        operator_name: &str,
        body: Bytes,
        callback: Callback,
    ) -> Result<PreparedCall> {
        validate(&callback)?;
        let operator = self.operator_code(operator_name);
        if operator == PING_OPERATOR {
            warn!(operator_name, "operator name hashes to the ping operator");
        }
        let key = CorrelationKey::new(operator, self.sequences.next());
        let frame = self.encode(key, body)?;

        let entry = PendingCall {
            callback: callback.clone(),
            timer: None,
        };
        if self.pending.insert(key, entry).is_some() {
            warn!(%key, "replaced a pending call with the same key");
        }
        Ok(PreparedCall {
            key,
            frame,
            callback,
        })
    }

    /// Register the ping listener and encode a ping frame.
    pub(crate) fn register_ping(&mut self, body: Bytes, callback: Callback) -> Result<PreparedCall> {
        validate(&callback)?;
        let key = CorrelationKey::new(PING_OPERATOR, 0);
        let frame = self.encode(key, body)?;
        self.listeners.insert(PING_OPERATOR, callback.clone());
        Ok(PreparedCall {
            key,
            frame,
            callback,
        })
    }

    fn encode(&self, key: CorrelationKey, body: Bytes) -> Result<Bytes> {
        let packet = Packet::new(key.operator, key.sequence, self.request_header.encode(), body);
        let mut buf = BytesMut::with_capacity(packet.wire_size() as usize);
        encode_packet(&packet, &mut buf, self.frame.max_frame_size)?;
        Ok(buf.freeze())
    }

    /// Register a persistent listener. Returns the operator code it listens on.
    pub(crate) fn add_listener(&mut self, operator_name: &str, listener: Callback) -> Result<u32> {
        validate(&listener)?;
        let operator = self.operator_code(operator_name);
        if self.listeners.insert(operator, listener).is_some() {
            debug!(operator_name, operator, "replaced message listener");
        }
        Ok(operator)
    }

    pub(crate) fn remove_listener(&mut self, operator_name: &str) -> bool {
        let operator = self.operator_code(operator_name);
        self.listeners.remove(&operator).is_some()
    }

    /// Attach the timeout timer to a pending call.
    ///
    /// Returns false if the call is no longer pending; the caller then owns
    /// the timer and should cancel it.
    pub(crate) fn set_timer(&mut self, key: &CorrelationKey, timer: TimerId) -> bool {
        match self.pending.get_mut(key) {
            Some(entry) => {
                entry.timer = Some(timer);
                true
            }
            None => false,
        }
    }

    /// Take a pending call out of the table, if it is still there.
    pub(crate) fn take_pending(&mut self, key: &CorrelationKey) -> Option<PendingCall> {
        self.pending.remove(key)
    }

    pub(crate) fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn request_header(&self) -> &HeaderTable {
        &self.request_header
    }

    pub(crate) fn request_header_mut(&mut self) -> &mut HeaderTable {
        &mut self.request_header
    }

    pub(crate) fn response_header(&self) -> &HeaderTable {
        &self.response_header
    }

    /// Match an inbound packet to its callback.
    ///
    /// On a match the response header table is replaced with the packet's
    /// header before the outcome is computed, and a one-shot entry is
    /// removed. Returns `None` if nothing is waiting for the packet.
    pub(crate) fn dispatch(&mut self, packet: &Packet) -> Option<Dispatched> {
        let key = CorrelationKey::of(packet);
        let (callback, timer) = match self.pending.remove(&key) {
            Some(entry) => (entry.callback, entry.timer),
            None => match self.listeners.get(&packet.operator) {
                Some(listener) => (listener.clone(), None),
                None => {
                    debug!(%key, "dropping frame with no matching call or listener");
                    return None;
                }
            },
        };

        self.response_header.replace_with(&packet.header);
        let outcome = self.outcome(packet);
        Some(Dispatched {
            delivery: Delivery { callback, outcome },
            timer,
        })
    }

    fn outcome(&self, packet: &Packet) -> Outcome {
        if let Some(raw_code) = self.response_header.get(CODE_KEY) {
            let message = self
                .response_header
                .get_decoded(MESSAGE_KEY)
                .unwrap_or_default();
            return match raw_code.parse::<i32>() {
                Ok(code) => Outcome::Failure { code, message },
                Err(_) => {
                    warn!(raw_code, "response carries a non-numeric error code");
                    Outcome::Failure {
                        code: UNKNOWN_ERROR_CODE,
                        message: format!("{raw_code}: {message}"),
                    }
                }
            };
        }

        match serde_json::from_slice(&packet.normalized_body()) {
            Ok(body) => Outcome::Success(body),
            Err(err) => {
                warn!(error = %err, operator = packet.operator, "response body is not valid JSON");
                Outcome::Failure {
                    code: INVALID_BODY_CODE,
                    message: err.to_string(),
                }
            }
        }
    }
}

fn validate(callback: &Callback) -> Result<()> {
    if callback.is_empty() {
        return Err(ClientError::InvalidCallback("callback has no hooks"));
    }
    Ok(())
}

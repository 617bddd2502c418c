//! Public client handle.
//!
//! [`Client`] ties the pieces together: the [`Multiplexer`] owns pending
//! calls and header tables, the [`ConnectionManager`] owns the transport,
//! and a [`Scheduler`] runs reconnect attempts and call timeouts.
//!
//! Lock discipline: the connection lock and the multiplexer lock are never
//! held at the same time, and no hook or scheduled task runs while either is
//! held. The connector is invoked under the connection lock; connectors do
//! not report events synchronously, so an early `Open` from a transport
//! thread waits until the transport has been attached.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use sockmux_frame::{decode_packet, Crc32Hasher, FrameError, HeaderTable, OperatorHasher};
use sockmux_transport::{Connector, EventHandler, EventSink, Message, TransportEvent};
use tracing::{debug, info, warn};

use crate::callback::{Callback, Delivery, Lifecycle, Outcome, CALL_TIMEOUT_CODE};
use crate::config::ClientConfig;
use crate::connection::{ConnectionAction, ConnectionManager, ConnectionState};
use crate::error::{ClientError, Result};
use crate::mux::{CorrelationKey, Multiplexer};
use crate::scheduler::{Scheduler, Task, ThreadScheduler, TimerId};
use crate::sequence::{Clock, SequenceGenerator, SystemClock};

const TIMEOUT_MESSAGE: &str = "request timed out";

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    hasher: Arc<dyn OperatorHasher>,
    lifecycle: Lifecycle,
}

impl ClientBuilder {
    fn new(config: ClientConfig, connector: Box<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            scheduler: Arc::new(ThreadScheduler::new()),
            clock: Arc::new(SystemClock),
            hasher: Arc::new(Crc32Hasher),
            lifecycle: Lifecycle::default(),
        }
    }

    /// Scheduler for reconnect attempts and call timeouts.
    /// Default: [`ThreadScheduler`].
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Time source for sequence numbers. Default: [`SystemClock`].
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Operator name hash. Default: CRC-32. Must match the server.
    pub fn hasher(mut self, hasher: impl OperatorHasher + 'static) -> Self {
        self.hasher = Arc::new(hasher);
        self
    }

    pub fn lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Build the client and issue the first connection attempt.
    ///
    /// Never fails: a refused first attempt is reported through
    /// `Lifecycle::on_error` and retried like any other failure.
    pub fn connect(self) -> Client {
        let mux = Multiplexer::new(
            self.hasher,
            SequenceGenerator::new(self.clock),
            self.config.frame.clone(),
        );
        let connection = ConnectionManager::new(self.config.reconnect.clone());
        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            config: self.config,
            connector: self.connector,
            scheduler: self.scheduler,
            lifecycle: self.lifecycle,
            connection: Mutex::new(connection),
            mux: Mutex::new(mux),
        });
        inner.connect_now(false);
        Client { inner }
    }
}

/// Handle to one logical connection.
///
/// Cheap to clone; clones share the connection, pending calls and header
/// tables. The connection is closed when the last handle is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn builder(config: ClientConfig, connector: impl Connector + 'static) -> ClientBuilder {
        ClientBuilder::new(config, Box::new(connector))
    }

    /// Connect with the default scheduler, clock and hasher.
    pub fn connect(config: ClientConfig, connector: impl Connector + 'static) -> Client {
        Self::builder(config, connector).connect()
    }

    /// Call `operator_name` with `param` serialized as the JSON body.
    ///
    /// `on_start` runs before the frame is written. The response, if any,
    /// runs exactly one of `on_success`/`on_error` followed by `on_end`.
    ///
    /// # Errors
    ///
    /// - [`ClientError::NotConnected`] unless the connection is open
    /// - [`ClientError::Json`] if `param` cannot be serialized
    /// - [`ClientError::InvalidCallback`] if `callback` has no hooks
    /// - [`ClientError::Frame`] if the frame exceeds the size limit
    ///
    /// Nothing is registered or sent when an error is returned.
    pub fn send<T>(
        &self,
        operator_name: &str,
        param: &T,
        callback: Callback,
    ) -> Result<CorrelationKey>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        let body = Bytes::from(serde_json::to_vec(param)?);
        let call = self
            .inner
            .mux()
            .register_call(operator_name, body, callback)?;
        debug!(
            operator_name,
            operator = call.key.operator,
            sequence = call.key.sequence,
            "sending call"
        );

        call.callback.start();
        self.inner.connection().send(call.frame);
        self.inner.arm_timeout(call.key);
        Ok(call.key)
    }

    /// Send a keep-alive on operator 0.
    ///
    /// `callback` becomes the persistent listener for operator 0, replacing
    /// any earlier one, and sees every acknowledgement that follows.
    pub fn ping<T>(&self, param: &T, callback: Callback) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.ensure_open()?;
        let body = Bytes::from(serde_json::to_vec(param)?);
        let call = self.inner.mux().register_ping(body, callback)?;
        debug!("sending ping");

        call.callback.start();
        self.inner.connection().send(call.frame);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        let state = self.inner.connection().state();
        if state != ConnectionState::Open {
            return Err(ClientError::NotConnected(state));
        }
        Ok(())
    }

    /// Register a persistent listener for every frame on `operator_name`
    /// that does not answer a pending call. Replaces an earlier listener.
    pub fn add_message_listener(&self, operator_name: &str, listener: Callback) -> Result<u32> {
        self.inner.mux().add_listener(operator_name, listener)
    }

    /// Returns true if a listener was registered.
    pub fn remove_message_listener(&self, operator_name: &str) -> bool {
        self.inner.mux().remove_listener(operator_name)
    }

    /// Forget a pending call. Its hooks never run.
    pub fn cancel(&self, key: CorrelationKey) -> bool {
        let Some(call) = self.inner.mux().take_pending(&key) else {
            return false;
        };
        self.inner.cancel_timer(call.timer);
        true
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.mux().pending_calls()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.mux().listener_count()
    }

    /// Operator code `operator_name` hashes to.
    pub fn operator_code(&self, operator_name: &str) -> u32 {
        self.inner.mux().operator_code(operator_name)
    }

    /// Set a header sent with every following request.
    pub fn set_request_header(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.mux().request_header_mut().set(key, value);
    }

    pub fn remove_request_header(&self, key: &str) -> Option<String> {
        self.inner.mux().request_header_mut().remove(key)
    }

    pub fn request_header(&self, key: &str) -> Option<String> {
        self.inner.mux().request_header().get(key).map(str::to_string)
    }

    /// Raw value of `key` in the header of the last dispatched response.
    ///
    /// Inside a hook this is the header of the response being delivered.
    pub fn response_header(&self, key: &str) -> Option<String> {
        self.inner.mux().response_header().get(key).map(str::to_string)
    }

    /// Snapshot of the last dispatched response header.
    pub fn response_headers(&self) -> HeaderTable {
        self.inner.mux().response_header().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection().state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Retries issued since the connection was last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.connection().reconnect_attempts()
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Pending calls stay registered; with a call timeout they expire.
    pub fn disconnect(&self) {
        let actions = self.inner.connection().disconnect();
        info!(url = %self.inner.config.url, "disconnected by application");
        self.inner.run_actions(actions);
    }

    /// Issue a connection attempt now, re-enabling reconnection after
    /// [`disconnect`](Self::disconnect). No-op while open.
    pub fn reconnect_now(&self) {
        self.inner.connect_now(true);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connection = self.inner.connection();
        f.debug_struct("Client")
            .field("url", &self.inner.config.url)
            .field("state", &connection.state())
            .field("generation", &connection.generation())
            .field("reconnect_attempts", &connection.reconnect_attempts())
            .field("reconnect_in_flight", &connection.reconnect_in_flight())
            .finish()
    }
}

struct Inner {
    this: Weak<Inner>,
    config: ClientConfig,
    connector: Box<dyn Connector>,
    scheduler: Arc<dyn Scheduler>,
    lifecycle: Lifecycle,
    connection: Mutex<ConnectionManager>,
    mux: Mutex<Multiplexer>,
}

impl Inner {
    fn connection(&self) -> MutexGuard<'_, ConnectionManager> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn mux(&self) -> MutexGuard<'_, Multiplexer> {
        self.mux.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect_now(&self, resume: bool) {
        let actions = {
            let mut connection = self.connection();
            if connection.state() == ConnectionState::Open {
                return;
            }
            if resume {
                connection.resume();
            }
            let generation = connection.begin_attempt();
            self.connect_locked(&mut connection, generation)
        };
        self.run_actions(actions);
    }

    fn reconnect_attempt(&self, scheduled_at: u64) {
        let actions = {
            let mut connection = self.connection();
            match connection.start_reconnect_attempt(scheduled_at) {
                Some(generation) => {
                    info!(
                        url = %self.config.url,
                        attempt = connection.reconnect_attempts(),
                        "reconnecting"
                    );
                    self.connect_locked(&mut connection, generation)
                }
                None => Vec::new(),
            }
        };
        self.run_actions(actions);
    }

    fn connect_locked(
        &self,
        connection: &mut ConnectionManager,
        generation: u64,
    ) -> Vec<ConnectionAction> {
        let handler: Weak<dyn EventHandler> = self.this.clone();
        let events = EventSink::new(handler, generation);
        match self.connector.connect(&self.config.url, events) {
            Ok(transport) => {
                connection.attach(generation, transport);
                Vec::new()
            }
            Err(err) => connection.on_error(generation, &err.to_string()),
        }
    }

    fn run_actions(&self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::NotifyOpen => self.lifecycle.opened(),
                ConnectionAction::NotifyClose => self.lifecycle.closed(),
                ConnectionAction::NotifyError(reason) => self.lifecycle.errored(&reason),
                ConnectionAction::ScheduleReconnect { delay, generation } => {
                    self.schedule_reconnect(delay, generation);
                }
            }
        }
    }

    fn schedule_reconnect(&self, delay: Duration, generation: u64) {
        let this = self.this.clone();
        let task: Task = Box::new(move || {
            if let Some(inner) = this.upgrade() {
                inner.reconnect_attempt(generation);
            }
        });
        if let Err(err) = self.scheduler.schedule(delay, task) {
            warn!(error = %err, generation, "could not schedule reconnect");
            self.connection().reconnect_unscheduled(generation);
            self.lifecycle.errored(&err.to_string());
        }
    }

    fn arm_timeout(&self, key: CorrelationKey) {
        let Some(timeout) = self.config.call_timeout else {
            return;
        };
        let this = self.this.clone();
        let task: Task = Box::new(move || {
            if let Some(inner) = this.upgrade() {
                inner.expire(key, timeout);
            }
        });
        let timer = match self.scheduler.schedule(timeout, task) {
            Ok(timer) => timer,
            Err(err) => {
                warn!(
                    error = %err,
                    %key,
                    "could not arm call timeout; call waits indefinitely"
                );
                return;
            }
        };
        let attached = self.mux().set_timer(&key, timer);
        if !attached {
            // Answered or cancelled before the timer was attached.
            self.scheduler.cancel(timer);
        }
    }

    fn cancel_timer(&self, timer: Option<TimerId>) {
        if let Some(timer) = timer {
            self.scheduler.cancel(timer);
        }
    }

    fn expire(&self, key: CorrelationKey, after: Duration) {
        let Some(call) = self.mux().take_pending(&key) else {
            return;
        };
        warn!(
            operator = key.operator,
            sequence = key.sequence,
            timeout_ms = after.as_millis() as u64,
            "call timed out"
        );
        Delivery {
            callback: call.callback,
            outcome: Outcome::Failure {
                code: CALL_TIMEOUT_CODE,
                message: TIMEOUT_MESSAGE.to_string(),
            },
        }
        .run();
    }

    fn on_frame(&self, generation: u64, data: &[u8]) {
        if !self.connection().is_current(generation) {
            debug!(generation, "dropping frame from stale transport");
            return;
        }
        let packet = match decode_packet(data, self.config.frame.max_frame_size) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, len = data.len(), "dropping undecodable frame");
                return;
            }
        };
        let dispatched = self.mux().dispatch(&packet);
        if let Some(dispatched) = dispatched {
            self.cancel_timer(dispatched.timer);
            dispatched.delivery.run();
        }
    }
}

impl EventHandler for Inner {
    fn handle_event(&self, generation: u64, event: TransportEvent) {
        let actions = match event {
            TransportEvent::Open => self.connection().on_open(generation),
            TransportEvent::Close => self.connection().on_close(generation),
            TransportEvent::Error(reason) => self.connection().on_error(generation, &reason),
            TransportEvent::Message(Message::Binary(data)) => {
                self.on_frame(generation, &data);
                return;
            }
            TransportEvent::Message(Message::Text(text)) => {
                warn!(
                    error = %FrameError::UnsupportedFrameFormat,
                    len = text.len(),
                    "dropping inbound message"
                );
                return;
            }
        };
        self.run_actions(actions);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::BytesMut;
    use serde_json::json;
    use sockmux_frame::{encode_packet, Packet, DEFAULT_MAX_FRAME, PING_OPERATOR};
    use sockmux_transport::{memory_pair, MemoryAcceptor, ServerEnd};

    use super::*;
    use crate::callback::INVALID_BODY_CODE;
    use crate::config::ReconnectPolicy;
    use crate::error::ScheduleError;
    use crate::scheduler::ManualScheduler;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Harness {
        client: Client,
        acceptor: MemoryAcceptor,
        scheduler: Arc<ManualScheduler>,
        events: Log,
    }

    fn harness(config: ClientConfig) -> Harness {
        let (connector, acceptor) = memory_pair();
        let scheduler = Arc::new(ManualScheduler::new());
        let events: Log = Arc::default();
        let (e1, e2, e3) = (events.clone(), events.clone(), events.clone());
        let lifecycle = Lifecycle::new()
            .on_open(move || e1.lock().unwrap().push("open".to_string()))
            .on_close(move || e2.lock().unwrap().push("close".to_string()))
            .on_error(move |reason| e3.lock().unwrap().push(format!("error {reason}")));
        let client = Client::builder(config, connector)
            .scheduler(scheduler.clone())
            .clock(|| 1_000i64)
            .lifecycle(lifecycle)
            .connect();
        Harness {
            client,
            acceptor,
            scheduler,
            events,
        }
    }

    impl Harness {
        fn accept_open(&self) -> ServerEnd {
            let server = self.acceptor.try_accept().expect("connection attempt");
            server.open();
            server
        }
    }

    fn config() -> ClientConfig {
        ClientConfig::new("mem://test")
    }

    fn recording() -> (Callback, Log) {
        let log: Log = Arc::default();
        let (l1, l2, l3, l4) = (log.clone(), log.clone(), log.clone(), log.clone());
        let callback = Callback::new()
            .on_start(move || l1.lock().unwrap().push("start".to_string()))
            .on_success(move |body| l2.lock().unwrap().push(format!("ok {body}")))
            .on_error(move |code, message| {
                l3.lock().unwrap().push(format!("err {code} {message}"))
            })
            .on_end(move || l4.lock().unwrap().push("end".to_string()));
        (callback, log)
    }

    fn frame(packet: &Packet) -> Bytes {
        let mut buf = BytesMut::new();
        encode_packet(packet, &mut buf, DEFAULT_MAX_FRAME).unwrap();
        buf.freeze()
    }

    fn received(server: &ServerEnd) -> Packet {
        let data = server.try_recv().expect("client should have sent a frame");
        decode_packet(&data, DEFAULT_MAX_FRAME).unwrap()
    }

    #[test]
    fn echo_round_trip() {
        let h = harness(config());
        let server = h.accept_open();
        assert!(h.client.is_open());
        assert_eq!(*h.events.lock().unwrap(), vec!["open".to_string()]);

        let (callback, log) = recording();
        let key = h
            .client
            .send("echo", &json!({"msg": "hi"}), callback)
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["start".to_string()]);

        let request = received(&server);
        assert_eq!(request.operator, h.client.operator_code("echo"));
        assert_eq!(request.sequence, key.sequence);
        assert_eq!(request.body.as_ref(), br#"{"msg":"hi"}"#);

        server.send(frame(&Packet::new(
            request.operator,
            request.sequence,
            "",
            Bytes::from_static(br#"{"msg":"hi"}"#),
        )));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start".to_string(),
                r#"ok {"msg":"hi"}"#.to_string(),
                "end".to_string()
            ]
        );
        assert_eq!(h.client.pending_calls(), 0);
    }

    #[test]
    fn send_before_open_is_not_connected() {
        let h = harness(config());
        let (callback, log) = recording();
        let err = h.client.send("echo", &json!({}), callback).unwrap_err();
        assert!(matches!(
            err,
            ClientError::NotConnected(ConnectionState::Connecting)
        ));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(h.client.pending_calls(), 0);
    }

    #[test]
    fn empty_callback_is_rejected_before_sending() {
        let h = harness(config());
        let server = h.accept_open();
        let err = h
            .client
            .send("echo", &json!({}), Callback::new())
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidCallback(_)));
        assert!(server.try_recv().is_none());
    }

    #[test]
    fn request_header_travels_with_frame() {
        let h = harness(config());
        let server = h.accept_open();
        h.client.set_request_header("token", "t1");
        h.client.set_request_header("token", "t2");
        assert_eq!(h.client.request_header("token").as_deref(), Some("t2"));

        let (callback, _) = recording();
        h.client.send("echo", "plain", callback).unwrap();
        assert_eq!(received(&server).header, "token=t2;");

        assert_eq!(h.client.remove_request_header("token").as_deref(), Some("t2"));
    }

    #[test]
    fn hooks_can_reenter_the_client() {
        let h = harness(config());
        let server = h.accept_open();

        let seen: Log = Arc::default();
        let (client, sink) = (h.client.clone(), seen.clone());
        let callback = Callback::new().on_success(move |_| {
            let trace = client.response_header("trace").unwrap_or_default();
            sink.lock()
                .unwrap()
                .push(format!("{trace} pending={}", client.pending_calls()));
        });
        h.client.send("echo", &json!({}), callback).unwrap();

        let request = received(&server);
        server.send(frame(&Packet::new(
            request.operator,
            request.sequence,
            "trace=abc;",
            Bytes::new(),
        )));
        assert_eq!(*seen.lock().unwrap(), vec!["abc pending=0".to_string()]);
        assert_eq!(h.client.response_headers().get("trace"), Some("abc"));
    }

    #[test]
    fn undecodable_and_text_frames_leave_connection_open() {
        let h = harness(config());
        let server = h.accept_open();
        let (callback, log) = recording();
        h.client.send("echo", &json!({}), callback).unwrap();

        server.send(Bytes::from_static(b"short"));
        server.send_text("hello");
        assert!(h.client.is_open());
        assert_eq!(h.client.pending_calls(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["start".to_string()]);
    }

    #[test]
    fn invalid_json_response() {
        let h = harness(config());
        let server = h.accept_open();
        let (callback, log) = recording();
        h.client.send("echo", &json!({}), callback).unwrap();

        let request = received(&server);
        server.send(frame(&Packet::new(
            request.operator,
            request.sequence,
            "",
            Bytes::from_static(b"{oops"),
        )));
        let log = log.lock().unwrap();
        assert!(log[1].starts_with(&format!("err {INVALID_BODY_CODE} ")));
        assert_eq!(log[2], "end");
    }

    #[test]
    fn ping_listener_sees_every_ack() {
        let h = harness(config());
        let server = h.accept_open();
        let (callback, log) = recording();
        h.client.ping(&json!({}), callback).unwrap();

        let ping = received(&server);
        assert_eq!(ping.operator, PING_OPERATOR);
        assert_eq!(ping.sequence, 0);

        for _ in 0..2 {
            server.send(frame(&Packet::ping("", Bytes::new())));
        }
        assert_eq!(log.lock().unwrap().len(), 5);
        assert_eq!(h.client.listener_count(), 1);
    }

    #[test]
    fn message_listener_lifecycle() {
        let h = harness(config());
        let server = h.accept_open();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let operator = h
            .client
            .add_message_listener(
                "news",
                Callback::new().on_success(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        server.send(frame(&Packet::new(operator, 7, "", Bytes::from_static(b"1"))));
        assert!(h.client.remove_message_listener("news"));
        server.send(frame(&Packet::new(operator, 8, "", Bytes::from_static(b"2"))));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(matches!(
            h.client.add_message_listener("news", Callback::new()),
            Err(ClientError::InvalidCallback(_))
        ));
    }

    #[test]
    fn close_reconnects_immediately_then_resets() {
        let h = harness(config());
        let server = h.accept_open();

        server.close();
        assert_eq!(h.client.state(), ConnectionState::Closed);
        assert_eq!(h.scheduler.pending_delays(), vec![Duration::ZERO]);

        assert_eq!(h.scheduler.advance(Duration::ZERO), 1);
        assert_eq!(h.client.state(), ConnectionState::Connecting);
        assert_eq!(h.client.reconnect_attempts(), 1);

        let second = h.accept_open();
        assert_ne!(second.generation(), server.generation());
        assert_eq!(h.client.reconnect_attempts(), 0);
        assert_eq!(
            *h.events.lock().unwrap(),
            vec!["open".to_string(), "close".to_string(), "open".to_string()]
        );
    }

    #[test]
    fn refused_attempts_back_off_linearly() {
        let h = harness(config());
        let server = h.accept_open();
        h.acceptor.refuse_next(2);

        server.close();
        assert_eq!(h.scheduler.run_next(), Some(Duration::ZERO));
        assert_eq!(h.scheduler.pending_delays(), vec![Duration::from_secs(1)]);
        assert_eq!(h.scheduler.run_next(), Some(Duration::from_secs(1)));
        assert_eq!(h.scheduler.pending_delays(), vec![Duration::from_secs(2)]);
        assert_eq!(h.scheduler.run_next(), Some(Duration::from_secs(2)));
        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(h.acceptor.attempts(), 4);

        h.accept_open();
        assert!(h.client.is_open());
        assert_eq!(h.client.reconnect_attempts(), 0);
    }

    #[test]
    fn stale_server_is_ignored_after_reconnect() {
        let h = harness(config());
        let old = h.accept_open();
        old.error("reset");
        h.scheduler.advance(Duration::ZERO);
        let _new = h.accept_open();

        old.close();
        assert!(h.client.is_open());
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[test]
    fn call_timeout_expires_pending_call() {
        let h = harness(config().with_call_timeout(Duration::from_secs(5)));
        let server = h.accept_open();
        let (callback, log) = recording();
        h.client.send("slow", &json!({}), callback).unwrap();

        h.scheduler.advance(Duration::from_secs(4));
        assert_eq!(h.client.pending_calls(), 1);
        h.scheduler.advance(Duration::from_secs(1));
        assert_eq!(h.client.pending_calls(), 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start".to_string(),
                format!("err {CALL_TIMEOUT_CODE} {TIMEOUT_MESSAGE}"),
                "end".to_string()
            ]
        );

        // A late response finds nothing.
        let request = received(&server);
        server.send(frame(&Packet::new(
            request.operator,
            request.sequence,
            "",
            Bytes::new(),
        )));
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn answered_call_does_not_time_out() {
        let h = harness(config().with_call_timeout(Duration::from_secs(5)));
        let server = h.accept_open();
        let (callback, log) = recording();
        h.client.send("fast", &json!({}), callback).unwrap();

        let request = received(&server);
        server.send(frame(&Packet::new(
            request.operator,
            request.sequence,
            "",
            Bytes::new(),
        )));
        h.scheduler.advance(Duration::from_secs(10));
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn answered_calls_leave_no_timers() {
        let h = harness(config().with_call_timeout(Duration::from_secs(60)));
        let server = h.accept_open();

        for _ in 0..50 {
            let (callback, _) = recording();
            h.client.send("fast", &json!({}), callback).unwrap();
        }
        assert_eq!(h.scheduler.pending(), 50);

        while let Some(data) = server.try_recv() {
            let request = decode_packet(&data, DEFAULT_MAX_FRAME).unwrap();
            server.send(frame(&Packet::new(
                request.operator,
                request.sequence,
                "",
                Bytes::new(),
            )));
        }
        assert_eq!(h.client.pending_calls(), 0);
        assert_eq!(h.scheduler.pending(), 0);

        let (callback, _) = recording();
        let key = h.client.send("fast", &json!({}), callback).unwrap();
        assert!(h.client.cancel(key));
        assert_eq!(h.scheduler.pending(), 0);
    }

    #[test]
    fn cancelled_call_never_runs_hooks() {
        let h = harness(config());
        let server = h.accept_open();
        let (callback, log) = recording();
        let key = h.client.send("echo", &json!({}), callback).unwrap();
        assert!(h.client.cancel(key));

        let request = received(&server);
        server.send(frame(&Packet::new(
            request.operator,
            request.sequence,
            "",
            Bytes::new(),
        )));
        assert_eq!(*log.lock().unwrap(), vec!["start".to_string()]);
    }

    #[test]
    fn disconnect_stops_reconnecting_until_asked() {
        let h = harness(config());
        let server = h.accept_open();

        h.client.disconnect();
        assert_eq!(h.client.state(), ConnectionState::Closed);
        assert!(server.is_closed());
        server.close();
        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(
            *h.events.lock().unwrap(),
            vec!["open".to_string(), "close".to_string()]
        );

        h.client.reconnect_now();
        assert_eq!(h.client.state(), ConnectionState::Connecting);
        h.accept_open();
        assert!(h.client.is_open());
    }

    #[test]
    fn superseded_retry_timer_does_not_cut_backoff_short() {
        let h = harness(config());
        let server = h.accept_open();
        h.acceptor.refuse_next(2);

        server.close();
        h.scheduler.advance(Duration::ZERO);
        assert_eq!(h.acceptor.attempts(), 2);
        assert_eq!(h.scheduler.pending_delays(), vec![Duration::from_secs(1)]);

        h.scheduler.advance(Duration::from_millis(500));
        h.client.disconnect();
        h.client.reconnect_now();
        assert_eq!(h.acceptor.attempts(), 3);
        assert_eq!(h.client.state(), ConnectionState::Closed);

        // The timer armed before the disconnect falls due first and is ignored.
        assert_eq!(h.scheduler.advance(Duration::from_millis(500)), 1);
        assert_eq!(h.acceptor.attempts(), 3);
        assert_eq!(h.client.state(), ConnectionState::Closed);

        assert_eq!(h.scheduler.advance(Duration::from_millis(500)), 1);
        assert_eq!(h.acceptor.attempts(), 4);
        assert_eq!(h.client.state(), ConnectionState::Connecting);
        h.accept_open();
        assert!(h.client.is_open());
    }

    /// Fails the next `failures` schedule calls, then defers to a
    /// [`ManualScheduler`].
    #[derive(Default)]
    struct FlakyScheduler {
        inner: ManualScheduler,
        failures: AtomicUsize,
    }

    impl Scheduler for FlakyScheduler {
        fn schedule(
            &self,
            delay: Duration,
            task: Task,
        ) -> std::result::Result<TimerId, ScheduleError> {
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(ScheduleError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::WouldBlock,
                    "no threads left",
                )));
            }
            self.inner.schedule(delay, task)
        }

        fn cancel(&self, id: TimerId) -> bool {
            self.inner.cancel(id)
        }
    }

    #[test]
    fn unschedulable_reconnect_is_reported_and_not_stuck() {
        let (connector, acceptor) = memory_pair();
        let scheduler = Arc::new(FlakyScheduler::default());
        let events: Log = Arc::default();
        let sink = events.clone();
        let client = Client::builder(config(), connector)
            .scheduler(scheduler.clone())
            .lifecycle(Lifecycle::new().on_error(move |reason| {
                sink.lock().unwrap().push(reason.to_string())
            }))
            .connect();
        let server = acceptor.try_accept().expect("connection attempt");
        server.open();

        scheduler.failures.store(1, Ordering::SeqCst);
        server.close();
        assert_eq!(scheduler.inner.pending(), 0);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["failed to start timer thread: no threads left".to_string()]
        );

        // The failed retry does not block the next one.
        server.error("reset");
        assert_eq!(scheduler.inner.pending_delays(), vec![Duration::ZERO]);
        scheduler.inner.advance(Duration::ZERO);
        acceptor.try_accept().expect("retry").open();
        assert!(client.is_open());
    }

    #[test]
    fn reconnect_disabled() {
        let h = harness(config().with_reconnect(ReconnectPolicy::disabled()));
        let server = h.accept_open();
        server.close();
        assert_eq!(h.scheduler.pending(), 0);
        assert_eq!(h.client.state(), ConnectionState::Closed);
    }

    #[test]
    fn debug_shows_connection_state() {
        let h = harness(config());
        let rendered = format!("{:?}", h.client);
        assert!(rendered.contains("mem://test"));
        assert!(rendered.contains("Connecting"));
    }

    #[test]
    fn refused_first_attempt_is_retried() {
        let (connector, acceptor) = memory_pair();
        acceptor.refuse_next(1);
        let scheduler = Arc::new(ManualScheduler::new());
        let client = Client::builder(config(), connector)
            .scheduler(scheduler.clone())
            .connect();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(acceptor.try_accept().is_none());

        scheduler.advance(Duration::ZERO);
        acceptor.try_accept().expect("retry").open();
        assert!(client.is_open());
    }
}

//! Connection lifecycle management.
//!
//! [`ConnectionManager`] owns the single live WebSocket, drives
//! dial/ping/pong/reconnect/version-resync, and presents a uniform
//! send/receive surface independent of connection state. All frame
//! handling, commands, and timer events are serialized through one
//! background actor task, so inbound frames are handled strictly in
//! arrival order and no locking is needed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use futures::{SinkExt as _, Stream, StreamExt as _};
use rand::Rng as _;
use secrecy::{ExposeSecret as _, SecretString};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, sleep_until, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::Result;
use crate::ack::AckRegistry;
use crate::bus::{Event, EventBus, ReloadReason};
use crate::config::Config;
use crate::endpoint::EndpointSelector;
use crate::envelope::{Inbound, Outbound, SendOptions, annotate_lag, annotate_timing};
use crate::error::{Error, TransportError};
use crate::lag::LagTracker;
use crate::store::{KvStore, MemoryStore};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close codes below this are considered clean and exempt the endpoint
/// from suspicion (normal closure and going-away).
const CLEAN_CLOSE_BELOW: u16 = 1002;

/// Raw receive callback. Returning `true` claims the message and
/// suppresses all further dispatch.
pub type RawReceiver = Box<dyn FnMut(&str, Option<&Value>) -> bool + Send>;

/// Per-type message handler. A registered handler claims its type;
/// unclaimed types fall through to the bus as `socket.in.<type>`.
pub type TypedHandler = Box<dyn FnMut(Option<&Value>, &Inbound) + Send>;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: StdInstant,
    },
    /// Reconnecting after failure
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Read-only snapshot of the transport, observable via a watch channel.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Status {
    /// Current connection state
    pub state: ConnectionState,
    /// Last applied server sequence number; `None` in unversioned mode
    pub version: Option<u64>,
    /// Smoothed round-trip time in milliseconds
    pub average_lag_ms: f64,
    /// Completed connection count
    pub connections: u32,
    /// Whether the transport is in idle mode
    pub idle: bool,
}

enum Command {
    Send {
        msg_type: String,
        data: Option<Value>,
        options: SendOptions,
    },
    SetSign(SecretString),
    WentIdle,
    BecameActive,
    SetOnline(bool),
    Reconnect,
    Destroy,
}

/// What to do after leaving an active connection.
enum Exit {
    /// Redial immediately (watchdog fired or reconnect requested)
    Immediate,
    /// Redial after the configured reconnect delay
    Delayed,
    /// Idle teardown fired; park until reactivated
    Dormant,
    /// Transport destroyed
    Destroyed,
}

/// How a command processed while disconnected affects the wait.
enum Flow {
    Continue,
    DialNow,
    Stop,
}

/// Handle to a resilient, versioned duplex transport.
///
/// Cloning is cheap; all clones command the same background actor. The
/// transport reconnects indefinitely with fixed delays, rotating the
/// endpoint whenever a failure is attributable to it.
///
/// # Example
///
/// ```ignore
/// let transport = ConnectionManager::connect()
///     .endpoints(vec!["ws1.example.com".to_owned(), "ws2.example.com".to_owned()])
///     .path("/play/abc123")
///     .version(0)
///     .call()?;
///
/// let mut events = transport.events();
/// transport.send("talk", Some(json!({"text": "hi"})))?;
/// while let Ok(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    bus: EventBus,
    status_rx: watch::Receiver<Status>,
    cancel: CancellationToken,
    config: Config,
}

#[bon::bon]
impl ConnectionManager {
    /// Create the transport and start dialing in a background task.
    ///
    /// `endpoints` is the ordered pool of interchangeable base URLs
    /// (host, or host plus port). `version` enables versioned mode with
    /// the last known applied sequence number; omit it for unversioned
    /// streams.
    #[builder]
    pub fn connect(
        endpoints: Vec<String>,
        #[builder(into)] path: String,
        #[builder(default)] secure: bool,
        version: Option<u64>,
        #[builder(default)] params: Vec<(String, String)>,
        #[builder(default)] is_auth: bool,
        receive: Option<RawReceiver>,
        #[builder(default)] handlers: HashMap<String, TypedHandler>,
        config: Option<Config>,
        store: Option<Arc<dyn KvStore>>,
        bus: Option<EventBus>,
    ) -> Result<Self> {
        let store = store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let mut config = config.unwrap_or_default();
        config.apply_ping_override(store.as_ref());

        let selector = EndpointSelector::new(endpoints, Arc::clone(&store), config.sticky_ttl)?;
        let bus = bus.unwrap_or_default();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status {
            state: ConnectionState::Disconnected,
            version,
            average_lag_ms: 0.0,
            connections: 0,
            idle: false,
        });
        let cancel = CancellationToken::new();

        let actor = Actor {
            config: config.clone(),
            path,
            secure,
            sri: Uuid::new_v4(),
            params,
            is_auth,
            receive,
            handlers,
            version,
            state: ConnectionState::Disconnected,
            selector,
            acks: AckRegistry::new(),
            lag: LagTracker::new(),
            bus: bus.clone(),
            cmd_rx,
            status_tx,
            cancel: cancel.clone(),
            queue: VecDeque::new(),
            sign: None,
            online: true,
            idle: false,
            idle_teardown_fired: false,
            teardown_at: None,
            connections: 0,
            attempt: 0,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            cmd_tx,
            bus,
            status_rx,
            cancel,
            config,
        })
    }
}

impl ConnectionManager {
    /// Send a message, queueing it for the next open socket when
    /// disconnected. Never blocks.
    pub fn send(&self, msg_type: &str, data: Option<Value>) -> Result<()> {
        self.send_with(msg_type, data, SendOptions::default())
    }

    /// Send with explicit options (ackable, lag/timing annotations,
    /// fire-and-forget, authorization token).
    pub fn send_with(&self, msg_type: &str, data: Option<Value>, options: SendOptions) -> Result<()> {
        self.cmd_tx
            .send(Command::Send {
                msg_type: msg_type.to_owned(),
                data,
                options,
            })
            .map_err(|_e| Error::from(TransportError::Destroyed))
    }

    /// Install the authorization token checked against per-send `sign`
    /// options.
    pub fn set_sign(&self, token: SecretString) {
        _ = self.cmd_tx.send(Command::SetSign(token));
    }

    /// Notify the transport that the user went idle. Reconnect scheduling
    /// relaxes and, after a bounded idle duration, the connection is torn
    /// down to free resources.
    pub fn went_idle(&self) {
        _ = self.cmd_tx.send(Command::WentIdle);
    }

    /// Notify the transport that the user is active again. Cancels a
    /// pending idle teardown; if the teardown already fired, a reload
    /// signal is published instead of silently reconnecting.
    pub fn became_active(&self) {
        _ = self.cmd_tx.send(Command::BecameActive);
    }

    /// Report host connectivity. While offline the transport retries on a
    /// short fixed cadence without dialing.
    pub fn set_online(&self, online: bool) {
        _ = self.cmd_tx.send(Command::SetOnline(online));
    }

    /// Force a fresh dial, tearing down any existing socket first.
    pub fn reconnect(&self) {
        _ = self.cmd_tx.send(Command::Reconnect);
    }

    /// Tear down the connection, cancel all timers, and stop reconnecting.
    pub fn destroy(&self) {
        _ = self.cmd_tx.send(Command::Destroy);
        self.cancel.cancel();
    }

    /// Subscribe to transport events from this point on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// The transport's bus, for sharing with other components.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Events as a stream. The stream ends with a
    /// [`TransportError::Lagged`] error if the subscriber falls too far
    /// behind.
    pub fn event_stream(&self) -> impl Stream<Item = Result<Event>> + Send + 'static {
        let mut rx = self.bus.subscribe();
        async_stream::try_stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(count)) => {
                        Err(Error::from(TransportError::Lagged { count }))?;
                    }
                }
            }
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn status(&self) -> Status {
        *self.status_rx.borrow()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    /// Last applied server sequence number, `None` in unversioned mode.
    #[must_use]
    pub fn version(&self) -> Option<u64> {
        self.status_rx.borrow().version
    }

    /// Smoothed round-trip average in milliseconds.
    #[must_use]
    pub fn average_lag_ms(&self) -> f64 {
        self.status_rx.borrow().average_lag_ms
    }

    /// Effective ping interval: configured delay (plus idle extra) plus
    /// the current average lag.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        let status = *self.status_rx.borrow();
        let idle_extra = if status.idle {
            self.config.idle_ping_extra
        } else {
            Duration::ZERO
        };
        self.config.ping_delay + idle_extra + Duration::from_millis(status.average_lag_ms as u64)
    }

    /// Subscribe to status changes, e.g. to detect reconnections.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<Status> {
        self.status_rx.clone()
    }
}

struct Actor {
    config: Config,
    path: String,
    secure: bool,
    /// Per-session random identifier carried in the dial query
    sri: Uuid,
    params: Vec<(String, String)>,
    is_auth: bool,
    receive: Option<RawReceiver>,
    handlers: HashMap<String, TypedHandler>,
    version: Option<u64>,
    state: ConnectionState,
    selector: EndpointSelector,
    acks: AckRegistry,
    lag: LagTracker,
    bus: EventBus,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<Status>,
    cancel: CancellationToken,
    /// Fully-built wire messages awaiting the next open socket, FIFO
    queue: VecDeque<String>,
    sign: Option<SecretString>,
    online: bool,
    idle: bool,
    idle_teardown_fired: bool,
    teardown_at: Option<Instant>,
    connections: u32,
    attempt: u32,
}

impl Actor {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.online {
                self.set_state(ConnectionState::Disconnected);
                if !self.wait_disconnected(self.config.offline_retry_delay).await {
                    break;
                }
                continue;
            }

            // a dial target that cannot even be built counts as an
            // immediate close with error, so the pool keeps rotating
            let exit = match self.dial_url() {
                Ok(url) => {
                    self.set_state(ConnectionState::Connecting);
                    tracing::debug!(%url, "connection attempt");
                    match timeout(self.config.ping_max_lag, connect_async(url.as_str())).await {
                        Ok(Ok((stream, _response))) => self.drive(stream).await,
                        Ok(Err(e)) => {
                            tracing::warn!(%url, error = %e, "unable to connect");
                            self.bus.publish(Event::Close);
                            self.selector.mark_suspect();
                            Exit::Delayed
                        }
                        Err(_elapsed) => {
                            tracing::warn!(%url, "dial timed out");
                            self.bus.publish(Event::Close);
                            self.selector.mark_suspect();
                            Exit::Immediate
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unable to build dial target");
                    self.bus.publish(Event::Close);
                    self.selector.mark_suspect();
                    Exit::Delayed
                }
            };

            match exit {
                Exit::Destroyed => break,
                Exit::Immediate => {}
                Exit::Delayed => {
                    self.attempt = self.attempt.saturating_add(1);
                    self.set_state(ConnectionState::Reconnecting {
                        attempt: self.attempt,
                    });
                    if !self.wait_disconnected(self.reconnect_delay()).await {
                        break;
                    }
                }
                Exit::Dormant => {
                    if !self.dormant_wait().await {
                        break;
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Drive one open socket until it dies. Timer deadlines live in this
    /// frame so a state transition cannot leave an orphaned timer armed.
    async fn drive(&mut self, stream: WsStream) -> Exit {
        let (mut write, mut read) = stream.split();

        self.connections += 1;
        self.attempt = 0;
        self.set_state(ConnectionState::Connected {
            since: StdInstant::now(),
        });
        self.bus.publish(Event::Open);
        if self.connections == 1 {
            self.bus.publish(Event::FirstConnect);
        }

        // Ping immediately, then flush everything queued while down and
        // resend the full ack ledger: server state is assumed lost.
        let mut watchdog: Option<Instant> = Some(Instant::now() + self.config.ping_max_lag);
        let mut ping_deadline: Option<Instant> = None;

        let payload = self.ping_payload();
        if write.send(Message::Text(payload.into())).await.is_err() {
            return self.unclean_exit();
        }
        self.lag.on_ping_sent(StdInstant::now());

        while let Some(wire) = self.queue.pop_front() {
            tracing::debug!(%wire, "flushing queued message");
            if write.send(Message::Text(wire.clone().into())).await.is_err() {
                self.queue.push_front(wire);
                return self.unclean_exit();
            }
        }
        for out in self.acks.resend_all(StdInstant::now()) {
            let Ok(wire) = serde_json::to_string(&out) else {
                continue;
            };
            if write.send(Message::Text(wire.into())).await.is_err() {
                return self.unclean_exit();
            }
        }

        let mut ack_tick = interval(self.config.ack_resend_interval);
        ack_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    _ = write.close().await;
                    return Exit::Destroyed;
                }

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.is_empty() || text.as_str() == "0" {
                            // bare heartbeat, never parsed as JSON
                            watchdog = None;
                            ping_deadline = Some(Instant::now() + self.ping_delay());
                            let average_ms = self.lag.on_pong(StdInstant::now());
                            self.bus.publish(Event::Lag { average_ms });
                            self.push_status();
                            continue;
                        }
                        match serde_json::from_str::<Inbound>(text.as_str()) {
                            Ok(m) => {
                                if m.t.as_deref() == Some("n") {
                                    watchdog = None;
                                    ping_deadline = Some(Instant::now() + self.ping_delay());
                                    let average_ms = self.lag.on_pong(StdInstant::now());
                                    self.bus.publish(Event::Lag { average_ms });
                                    self.push_status();
                                }
                                self.handle(m);
                            }
                            Err(e) => {
                                tracing::warn!(%text, error = %e, "dropping malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let clean = frame
                            .as_ref()
                            .is_some_and(|f| u16::from(f.code) < CLEAN_CLOSE_BELOW);
                        self.bus.publish(Event::Close);
                        if clean {
                            return Exit::Delayed;
                        }
                        tracing::warn!(?frame, "unclean close");
                        self.selector.mark_suspect();
                        return Exit::Delayed;
                    }
                    Some(Ok(_)) => {
                        // binary frames and protocol-level ping/pong are not part of the envelope contract
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "socket error");
                        return self.unclean_exit();
                    }
                    None => {
                        return self.unclean_exit();
                    }
                },

                cmd = self.cmd_rx.recv() => match cmd {
                    None => {
                        _ = write.close().await;
                        return Exit::Destroyed;
                    }
                    Some(Command::Send { msg_type, data, options }) => {
                        let no_retry = options.no_retry;
                        if let Some(wire) = self.build_outbound(&msg_type, data, &options) {
                            tracing::trace!(%wire, "send");
                            if write.send(Message::Text(wire.clone().into())).await.is_err() {
                                if !no_retry {
                                    self.queue.push_back(wire);
                                }
                                return self.unclean_exit();
                            }
                        }
                    }
                    Some(Command::SetSign(token)) => self.sign = Some(token),
                    Some(Command::WentIdle) => {
                        self.idle = true;
                        self.teardown_at = Some(Instant::now() + self.config.idle_teardown_after);
                        self.push_status();
                    }
                    Some(Command::BecameActive) => {
                        self.idle = false;
                        self.teardown_at = None;
                        self.push_status();
                    }
                    Some(Command::SetOnline(online)) => self.online = online,
                    Some(Command::Reconnect) => {
                        _ = write.close().await;
                        return Exit::Immediate;
                    }
                    Some(Command::Destroy) => {
                        _ = write.close().await;
                        self.cancel.cancel();
                        return Exit::Destroyed;
                    }
                },

                _ = ack_tick.tick() => {
                    let due = self
                        .acks
                        .due_for_resend(StdInstant::now(), self.config.ack_resend_cutoff);
                    for out in due {
                        let Ok(wire) = serde_json::to_string(&out) else {
                            continue;
                        };
                        tracing::debug!(%wire, "resending unacknowledged message");
                        if write.send(Message::Text(wire.into())).await.is_err() {
                            return self.unclean_exit();
                        }
                    }
                }

                () = sleep_until(deadline_or_far(ping_deadline)), if ping_deadline.is_some() => {
                    ping_deadline = None;
                    watchdog = Some(Instant::now() + self.config.ping_max_lag);
                    let payload = self.ping_payload();
                    if write.send(Message::Text(payload.into())).await.is_err() {
                        return self.unclean_exit();
                    }
                    self.lag.on_ping_sent(StdInstant::now());
                }

                () = sleep_until(deadline_or_far(watchdog)), if watchdog.is_some() => {
                    tracing::warn!(sri = %self.sri, "no pong within ping_max_lag, resetting connection");
                    self.bus.publish(Event::Close);
                    self.selector.mark_suspect();
                    return Exit::Immediate;
                }

                () = sleep_until(deadline_or_far(self.teardown_at)), if self.teardown_at.is_some() => {
                    tracing::debug!("idle for too long, tearing down connection");
                    self.teardown_at = None;
                    self.idle_teardown_fired = true;
                    _ = write.close().await;
                    self.bus.publish(Event::Close);
                    return Exit::Dormant;
                }
            }
        }
    }

    fn unclean_exit(&mut self) -> Exit {
        self.bus.publish(Event::Close);
        self.selector.mark_suspect();
        Exit::Delayed
    }

    /// Inbound dispatch, run synchronously per frame in arrival order.
    fn handle(&mut self, m: Inbound) {
        if let (Some(v), Some(current)) = (m.v, self.version) {
            if v <= current {
                tracing::debug!(v, "already has event");
                return;
            }
            if v > current + 1 {
                // cannot be filled locally; ask the host for full state
                tracing::warn!(v, current, "sequence gap, requesting resync");
                self.bus.publish(Event::Reload {
                    reason: ReloadReason::VersionGap,
                });
                return;
            }
            self.version = Some(v);
            self.push_status();
        }

        match m.t.as_deref() {
            None => {}
            Some("resync") => {
                let bus = self.bus.clone();
                let delay = self.config.resync_reload_delay;
                tokio::spawn(async move {
                    sleep(delay).await;
                    bus.publish(Event::Reload {
                        reason: ReloadReason::ServerResync,
                    });
                });
            }
            Some("ack") => {
                if let Some(id) = m.d.as_ref().and_then(Value::as_u64) {
                    self.acks.on_ack(id);
                } else {
                    tracing::debug!(data = ?m.d, "ack without a numeric id");
                }
            }
            Some(msg_type) => {
                if let Some(receive) = self.receive.as_mut()
                    && receive(msg_type, m.d.as_ref())
                {
                    return;
                }
                if let Some(handler) = self.handlers.get_mut(msg_type) {
                    handler(m.d.as_ref(), &m);
                    return;
                }
                self.bus.publish(Event::Inbound {
                    msg_type: msg_type.to_owned(),
                    data: m.d,
                });
            }
        }
    }

    /// Build the outbound wire message, injecting transport annotations
    /// into a payload owned by value. Returns `None` when the send is
    /// dropped (stale authorization token or serialization failure).
    fn build_outbound(
        &mut self,
        msg_type: &str,
        mut data: Option<Value>,
        options: &SendOptions,
    ) -> Option<String> {
        if let Some(required) = &options.sign {
            let current = self.sign.as_ref().map(|s| s.expose_secret());
            if current != Some(required.as_str()) {
                tracing::debug!(msg_type, "dropping send with stale authorization token");
                return None;
            }
        }
        if options.with_lag {
            annotate_lag(&mut data, self.lag.average_ms());
        }
        if let Some(millis) = options.millis {
            annotate_timing(&mut data, millis);
        }
        if options.ackable {
            self.acks.register(msg_type, &mut data, StdInstant::now());
        }

        match serde_json::to_string(&Outbound::new(msg_type, data)) {
            Ok(wire) => Some(wire),
            Err(e) => {
                tracing::error!(msg_type, error = %e, "failed to serialize outbound message");
                None
            }
        }
    }

    fn ping_payload(&self) -> String {
        // every 10th ping (offset 2) of an authenticated session carries
        // the smoothed lag so the server can adapt
        if self.is_auth && self.lag.pong_count() % 10 == 2 {
            serde_json::json!({
                "t": "p",
                "l": (0.1 * self.lag.average_ms()).round() as u64,
            })
            .to_string()
        } else {
            "null".to_owned()
        }
    }

    fn ping_delay(&self) -> Duration {
        if self.idle {
            self.config.ping_delay + self.config.idle_ping_extra
        } else {
            self.config.ping_delay
        }
    }

    fn reconnect_delay(&self) -> Duration {
        if self.idle {
            let min = self.config.idle_reconnect_min.as_millis() as u64;
            let max = self.config.idle_reconnect_max.as_millis() as u64;
            Duration::from_millis(rand::rng().random_range(min..=max))
        } else {
            self.config.auto_reconnect_delay
        }
    }

    fn dial_url(&mut self) -> Result<Url> {
        let host = self.selector.choose();
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{host}{}", self.path))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sri", &self.sri.to_string());
            for (key, value) in &self.params {
                query.append_pair(key, value);
            }
            if let Some(v) = self.version {
                query.append_pair("v", &v.to_string());
            }
        }
        Ok(url)
    }

    /// Wait out a reconnect delay while still servicing commands.
    /// Returns `false` when the transport is destroyed.
    async fn wait_disconnected(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = sleep_until(deadline) => return true,
                () = sleep_until(deadline_or_far(self.teardown_at)), if self.teardown_at.is_some() => {
                    self.teardown_at = None;
                    self.idle_teardown_fired = true;
                    return self.dormant_wait().await;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return false,
                    Some(cmd) => match self.handle_disconnected_command(cmd) {
                        Flow::Continue => {}
                        Flow::DialNow => return true,
                        Flow::Stop => return false,
                    },
                },
            }
        }
    }

    /// Parked after an idle teardown: no socket, no reconnect schedule.
    /// Becoming active publishes a reload signal instead of silently
    /// reconnecting; only an explicit reconnect resumes dialing.
    async fn dormant_wait(&mut self) -> bool {
        self.set_state(ConnectionState::Disconnected);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return false,
                    Some(Command::BecameActive) => {
                        self.idle = false;
                        self.push_status();
                        if self.idle_teardown_fired {
                            self.idle_teardown_fired = false;
                            self.bus.publish(Event::Reload {
                                reason: ReloadReason::StaleAfterIdle,
                            });
                        }
                    }
                    Some(Command::Reconnect) => {
                        self.idle_teardown_fired = false;
                        return true;
                    }
                    Some(cmd) => match self.handle_disconnected_command(cmd) {
                        Flow::Continue | Flow::DialNow => {}
                        Flow::Stop => return false,
                    },
                },
            }
        }
    }

    fn handle_disconnected_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Send {
                msg_type,
                data,
                options,
            } => {
                let no_retry = options.no_retry;
                if let Some(wire) = self.build_outbound(&msg_type, data, &options) {
                    if no_retry {
                        tracing::debug!(%wire, "dropping fire-and-forget send while disconnected");
                    } else {
                        self.queue.push_back(wire);
                    }
                }
                Flow::Continue
            }
            Command::SetSign(token) => {
                self.sign = Some(token);
                Flow::Continue
            }
            Command::WentIdle => {
                self.idle = true;
                self.teardown_at = Some(Instant::now() + self.config.idle_teardown_after);
                self.push_status();
                Flow::Continue
            }
            Command::BecameActive => {
                self.idle = false;
                self.teardown_at = None;
                self.push_status();
                Flow::Continue
            }
            Command::SetOnline(online) => {
                self.online = online;
                if online { Flow::DialNow } else { Flow::Continue }
            }
            Command::Reconnect => Flow::DialNow,
            Command::Destroy => {
                self.cancel.cancel();
                Flow::Stop
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.push_status();
    }

    fn push_status(&self) {
        _ = self.status_tx.send(Status {
            state: self.state,
            version: self.version,
            average_lag_ms: self.lag.average_ms(),
            connections: self.connections,
            idle: self.idle,
        });
    }
}

fn deadline_or_far(deadline: Option<Instant>) -> Instant {
    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(24 * 60 * 60))
}

#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use duplex_transport::{
    Config, ConnectionManager, Event, KvStore as _, MemoryStore, ReloadReason, SendOptions,
};
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

#[derive(Debug, Clone)]
enum ServerCmd {
    /// Push a frame to every connected client
    Text(String),
    /// Close every connected client cleanly
    Close,
}

/// Mock WebSocket server.
struct MockWsServer {
    addr: SocketAddr,
    cmd_tx: broadcast::Sender<ServerCmd>,
    /// Receives (connection id, text) for every non-heartbeat client frame
    inbound_rx: mpsc::UnboundedReceiver<(usize, String)>,
    connections: Arc<AtomicUsize>,
}

impl MockWsServer {
    /// Start a mock server on a random port. Heartbeat frames (`null` or
    /// `{"t":"p",..}`) are answered with a bare `"0"` pong and not
    /// forwarded.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (cmd_tx, _) = broadcast::channel::<ServerCmd>(100);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<(usize, String)>();
        let connections = Arc::new(AtomicUsize::new(0));

        let accept_cmd_tx = cmd_tx.clone();
        let accept_connections = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };

                let conn_id = accept_connections.fetch_add(1, Ordering::SeqCst);
                let (mut write, mut read) = ws_stream.split();
                let inbound_tx = inbound_tx.clone();
                let mut cmd_rx = accept_cmd_tx.subscribe();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        if is_heartbeat(text.as_str()) {
                                            if write.send(Message::Text("0".into())).await.is_err() {
                                                break;
                                            }
                                        } else {
                                            drop(inbound_tx.send((conn_id, text.to_string())));
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            cmd = cmd_rx.recv() => {
                                match cmd {
                                    Ok(ServerCmd::Text(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(ServerCmd::Close) => {
                                        let frame = CloseFrame {
                                            code: CloseCode::Normal,
                                            reason: "bye".into(),
                                        };
                                        drop(write.send(Message::Close(Some(frame))).await);
                                        break;
                                    }
                                    Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            cmd_tx,
            inbound_rx,
            connections,
        }
    }

    fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    fn send(&self, payload: &Value) {
        drop(self.cmd_tx.send(ServerCmd::Text(payload.to_string())));
    }

    fn close_all(&self) {
        drop(self.cmd_tx.send(ServerCmd::Close));
    }

    async fn recv_text(&mut self) -> Option<(usize, String)> {
        timeout(Duration::from_secs(2), self.inbound_rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn is_heartbeat(text: &str) -> bool {
    if text == "null" {
        return true;
    }
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("t").and_then(Value::as_str).map(|t| t == "p"))
        .unwrap_or(false)
}

/// Store with the sticky endpoint choice pre-pinned to `url`.
fn pinned_store(url: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let sticky = json!({"url": url, "at_ms": Utc::now().timestamp_millis()});
    store.set("socket.endpoint", &sticky.to_string());
    store
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.ping_delay = Duration::from_millis(100);
    config.ping_max_lag = Duration::from_millis(2000);
    config.auto_reconnect_delay = Duration::from_millis(50);
    config.offline_retry_delay = Duration::from_millis(50);
    config.ack_resend_interval = Duration::from_millis(100);
    config.ack_resend_cutoff = Duration::from_millis(200);
    config.resync_reload_delay = Duration::from_millis(50);
    config
}

fn transport_for(server: &MockWsServer, version: Option<u64>) -> ConnectionManager {
    let builder = ConnectionManager::connect()
        .endpoints(vec![server.endpoint()])
        .path("/socket/v5")
        .config(fast_config());
    match version {
        Some(v) => builder.version(v).call().unwrap(),
        None => builder.call().unwrap(),
    }
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for(
    rx: &mut broadcast::Receiver<Event>,
    mut pred: impl FnMut(&Event) -> bool,
) -> Event {
    timeout(Duration::from_secs(3), async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn undispatched_inbound_reaches_the_bus() {
    let server = MockWsServer::start().await;
    let transport = transport_for(&server, None);
    let mut events = transport.events();

    wait_for(&mut events, |e| matches!(e, Event::Open)).await;
    server.send(&json!({"t": "crowd", "d": {"watchers": 42}}));

    let event = wait_for(&mut events, |e| matches!(e, Event::Inbound { .. })).await;
    let Event::Inbound { msg_type, data } = event else {
        unreachable!()
    };
    assert_eq!(msg_type, "crowd");
    assert_eq!(data, Some(json!({"watchers": 42})));

    transport.destroy();
}

#[tokio::test]
async fn first_connect_is_one_shot() {
    let server = MockWsServer::start().await;
    let transport = transport_for(&server, None);
    let mut events = transport.events();

    wait_for(&mut events, |e| matches!(e, Event::FirstConnect)).await;

    // force a reconnect; the second open must not repeat the one-shot
    server.close_all();
    wait_for(&mut events, |e| matches!(e, Event::Close)).await;
    let reopened = wait_for(&mut events, |e| {
        matches!(e, Event::Open | Event::FirstConnect)
    })
    .await;
    assert!(matches!(reopened, Event::Open), "got {reopened:?}");

    transport.destroy();
}

#[tokio::test]
async fn versions_are_deduplicated_and_gaps_force_a_reload() {
    let server = MockWsServer::start().await;
    let transport = transport_for(&server, Some(0));
    let mut events = transport.events();

    wait_for(&mut events, |e| matches!(e, Event::Open)).await;

    server.send(&json!({"t": "move", "d": {"n": 1}, "v": 1}));
    server.send(&json!({"t": "move", "d": {"n": 1}, "v": 1})); // duplicate
    server.send(&json!({"t": "move", "d": {"n": 2}, "v": 2}));

    let first = wait_for(&mut events, |e| matches!(e, Event::Inbound { .. })).await;
    let second = wait_for(&mut events, |e| matches!(e, Event::Inbound { .. })).await;
    let Event::Inbound { data: d1, .. } = first else {
        unreachable!()
    };
    let Event::Inbound { data: d2, .. } = second else {
        unreachable!()
    };
    assert_eq!(d1, Some(json!({"n": 1})));
    assert_eq!(d2, Some(json!({"n": 2})), "duplicate must be dropped");

    // gap: jumps from 2 straight to 5
    server.send(&json!({"t": "move", "d": {"n": 5}, "v": 5}));
    let reload = wait_for(&mut events, |e| matches!(e, Event::Reload { .. })).await;
    assert!(matches!(
        reload,
        Event::Reload {
            reason: ReloadReason::VersionGap
        }
    ));
    assert_eq!(transport.version(), Some(2), "gap must not advance");

    transport.destroy();
}

#[tokio::test]
async fn resync_request_schedules_a_reload() {
    let server = MockWsServer::start().await;
    let transport = transport_for(&server, None);
    let mut events = transport.events();

    wait_for(&mut events, |e| matches!(e, Event::Open)).await;
    server.send(&json!({"t": "resync"}));

    let reload = wait_for(&mut events, |e| matches!(e, Event::Reload { .. })).await;
    assert!(matches!(
        reload,
        Event::Reload {
            reason: ReloadReason::ServerResync
        }
    ));

    transport.destroy();
}

#[tokio::test]
async fn ackable_send_is_retried_until_acknowledged() {
    let mut server = MockWsServer::start().await;
    let transport = transport_for(&server, None);
    let mut events = transport.events();
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;

    transport
        .send_with(
            "talk",
            Some(json!({"text": "hi"})),
            SendOptions::builder().ackable(true).build(),
        )
        .unwrap();

    let (_, first) = server.recv_text().await.expect("initial transmission");
    let msg: Value = serde_json::from_str(&first).unwrap();
    assert_eq!(msg["t"], "talk");
    assert_eq!(msg["d"]["a"], json!(1));

    // unacknowledged: resent past the cutoff
    let (_, second) = server.recv_text().await.expect("timed retry");
    assert_eq!(first, second);

    // acknowledge; no further retransmission
    server.send(&json!({"t": "ack", "d": 1}));
    sleep(Duration::from_millis(500)).await;
    assert!(
        server.inbound_rx.try_recv().is_err(),
        "acked message must stop retrying"
    );

    transport.destroy();
}

#[tokio::test]
async fn queued_sends_flush_in_order_on_reconnect() {
    let mut server = MockWsServer::start().await;
    let transport = transport_for(&server, None);
    let mut events = transport.events();
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;

    server.close_all();
    wait_for(&mut events, |e| matches!(e, Event::Close)).await;

    transport.send("first", Some(json!({"n": 1}))).unwrap();
    transport.send("second", Some(json!({"n": 2}))).unwrap();
    transport.send("third", Some(json!({"n": 3}))).unwrap();

    wait_for(&mut events, |e| matches!(e, Event::Open)).await;

    let (conn, a) = server.recv_text().await.unwrap();
    let (_, b) = server.recv_text().await.unwrap();
    let (_, c) = server.recv_text().await.unwrap();
    assert!(conn > 0, "flush must land on the second connection");

    let types: Vec<String> = [a, b, c]
        .iter()
        .map(|raw| {
            serde_json::from_str::<Value>(raw).unwrap()["t"]
                .as_str()
                .unwrap()
                .to_owned()
        })
        .collect();
    assert_eq!(types, ["first", "second", "third"], "strict FIFO flush");

    transport.destroy();
}

#[tokio::test]
async fn pongs_feed_the_lag_average() {
    let server = MockWsServer::start().await;
    let transport = transport_for(&server, None);
    let mut events = transport.events();

    let lag = wait_for(&mut events, |e| matches!(e, Event::Lag { .. })).await;
    let Event::Lag { average_ms } = lag else {
        unreachable!()
    };
    assert!(average_ms >= 0.0);
    assert!(
        transport.ping_interval() >= Duration::from_millis(100),
        "ping interval includes the configured delay"
    );

    transport.destroy();
}

#[tokio::test]
async fn typed_handler_claims_its_message_type() {
    let server = MockWsServer::start().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Value>();

    let mut handlers: std::collections::HashMap<String, duplex_transport::connection::TypedHandler> =
        std::collections::HashMap::new();
    handlers.insert(
        "chat".to_owned(),
        Box::new(move |data, _msg| {
            drop(seen_tx.send(data.cloned().unwrap_or(Value::Null)));
        }),
    );

    let transport = ConnectionManager::connect()
        .endpoints(vec![server.endpoint()])
        .path("/socket/v5")
        .config(fast_config())
        .handlers(handlers)
        .call()
        .unwrap();
    let mut events = transport.events();
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;

    server.send(&json!({"t": "chat", "d": {"text": "hello"}}));

    let seen = timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, json!({"text": "hello"}));

    // claimed by the handler: never published on the bus
    server.send(&json!({"t": "other"}));
    let event = wait_for(&mut events, |e| matches!(e, Event::Inbound { .. })).await;
    let Event::Inbound { msg_type, .. } = event else {
        unreachable!()
    };
    assert_eq!(msg_type, "other");

    transport.destroy();
}

#[tokio::test]
async fn raw_receiver_suppresses_all_dispatch() {
    let server = MockWsServer::start().await;
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

    let transport = ConnectionManager::connect()
        .endpoints(vec![server.endpoint()])
        .path("/socket/v5")
        .config(fast_config())
        .receive(Box::new(move |msg_type, _data| {
            if msg_type == "claimed" {
                drop(seen_tx.send(msg_type.to_owned()));
                true
            } else {
                false
            }
        }))
        .call()
        .unwrap();
    let mut events = transport.events();
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;

    server.send(&json!({"t": "claimed"}));
    server.send(&json!({"t": "passed"}));

    let event = wait_for(&mut events, |e| matches!(e, Event::Inbound { .. })).await;
    let Event::Inbound { msg_type, .. } = event else {
        unreachable!()
    };
    assert_eq!(msg_type, "passed", "claimed type must not reach the bus");
    assert_eq!(seen_rx.recv().await.as_deref(), Some("claimed"));

    transport.destroy();
}

#[tokio::test]
async fn dial_failure_rotates_to_the_next_endpoint() {
    let server = MockWsServer::start().await;

    // pin the sticky choice to a dead endpoint; the transport must rotate
    // off it and reach the live one
    let store = pinned_store("127.0.0.1:1");

    let transport = ConnectionManager::connect()
        .endpoints(vec!["127.0.0.1:1".to_owned(), server.endpoint()])
        .path("/socket/v5")
        .config(fast_config())
        .store(store as Arc<dyn duplex_transport::KvStore>)
        .call()
        .unwrap();
    let mut events = transport.events();

    wait_for(&mut events, |e| matches!(e, Event::Open)).await;
    assert_eq!(server.connection_count(), 1);

    transport.destroy();
}

#[tokio::test]
async fn destroy_stops_the_transport() {
    let server = MockWsServer::start().await;
    let transport = transport_for(&server, None);
    let mut events = transport.events();
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;

    transport.destroy();

    let stopped = timeout(Duration::from_secs(2), async {
        loop {
            if transport.send("late", None).is_err() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "sends must fail after destroy");
    assert!(!transport.state().is_connected());
}

#[tokio::test]
async fn sign_mismatch_drops_the_send() {
    let mut server = MockWsServer::start().await;
    let transport = transport_for(&server, None);
    let mut events = transport.events();
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;

    transport.set_sign("token-a".into());
    transport
        .send_with(
            "move",
            Some(json!({"u": "e2e4"})),
            SendOptions::builder().sign("token-b".to_owned()).build(),
        )
        .unwrap();
    transport
        .send_with(
            "move",
            Some(json!({"u": "d2d4"})),
            SendOptions::builder().sign("token-a".to_owned()).build(),
        )
        .unwrap();

    let (_, text) = server.recv_text().await.expect("matching sign goes out");
    let msg: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(msg["d"]["u"], json!("d2d4"), "mismatched sign is dropped");

    transport.destroy();
}

#[tokio::test]
async fn unparseable_endpoint_rotates_instead_of_dying() {
    let server = MockWsServer::start().await;

    // "bad host" never parses into a dial URL; the transport must treat
    // it like any other failed dial and rotate to the live candidate
    let store = pinned_store("bad host");

    let transport = ConnectionManager::connect()
        .endpoints(vec!["bad host".to_owned(), server.endpoint()])
        .path("/socket/v5")
        .config(fast_config())
        .store(store as Arc<dyn duplex_transport::KvStore>)
        .call()
        .unwrap();
    let mut events = transport.events();

    wait_for(&mut events, |e| matches!(e, Event::Close)).await;
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;
    assert_eq!(server.connection_count(), 1);

    transport.destroy();
}

#[tokio::test]
async fn dial_timeout_publishes_close_and_rotates() {
    let server = MockWsServer::start().await;

    // accepts TCP but never answers the WebSocket handshake
    let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let mut config = fast_config();
    config.ping_max_lag = Duration::from_millis(300);
    let store = pinned_store(&silent_addr);

    let bus = duplex_transport::bus::EventBus::new();
    let mut events = bus.subscribe();
    let transport = ConnectionManager::connect()
        .endpoints(vec![silent_addr, server.endpoint()])
        .path("/socket/v5")
        .config(config)
        .store(store as Arc<dyn duplex_transport::KvStore>)
        .bus(bus)
        .call()
        .unwrap();

    wait_for(&mut events, |e| matches!(e, Event::Close)).await;
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;
    assert_eq!(server.connection_count(), 1);

    transport.destroy();
}

#[tokio::test]
async fn idle_teardown_goes_dormant_until_reactivated() {
    let server = MockWsServer::start().await;
    let mut config = fast_config();
    config.idle_teardown_after = Duration::from_millis(200);

    let transport = ConnectionManager::connect()
        .endpoints(vec![server.endpoint()])
        .path("/socket/v5")
        .config(config)
        .call()
        .unwrap();
    let mut events = transport.events();
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;

    transport.went_idle();
    wait_for(&mut events, |e| matches!(e, Event::Close)).await;

    // dormant: no reconnect schedule
    sleep(Duration::from_millis(400)).await;
    assert_eq!(server.connection_count(), 1, "dormant must not redial");
    assert!(!transport.state().is_connected());

    // activity after the teardown signals staleness instead of silently
    // reconnecting
    transport.became_active();
    let reload = wait_for(&mut events, |e| matches!(e, Event::Reload { .. })).await;
    assert!(matches!(
        reload,
        Event::Reload {
            reason: ReloadReason::StaleAfterIdle
        }
    ));
    assert_eq!(server.connection_count(), 1);

    // only an explicit reconnect resumes dialing
    transport.reconnect();
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;
    assert_eq!(server.connection_count(), 2);

    transport.destroy();
}

#[tokio::test]
async fn idle_reconnect_delay_is_relaxed() {
    let server = MockWsServer::start().await;
    let mut config = fast_config();
    config.idle_reconnect_min = Duration::from_millis(400);
    config.idle_reconnect_max = Duration::from_millis(600);

    let transport = ConnectionManager::connect()
        .endpoints(vec![server.endpoint()])
        .path("/socket/v5")
        .config(config)
        .call()
        .unwrap();
    let mut events = transport.events();
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;

    transport.went_idle();
    sleep(Duration::from_millis(50)).await;
    server.close_all();
    wait_for(&mut events, |e| matches!(e, Event::Close)).await;

    let closed_at = tokio::time::Instant::now();
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;
    assert!(
        closed_at.elapsed() >= Duration::from_millis(300),
        "idle reconnect must wait out the randomized window, not the active delay"
    );

    transport.destroy();
}

#[tokio::test]
async fn offline_mode_holds_dialing_until_online() {
    let server = MockWsServer::start().await;
    let transport = transport_for(&server, None);
    let mut events = transport.events();
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;

    transport.set_online(false);
    sleep(Duration::from_millis(50)).await;
    server.close_all();
    wait_for(&mut events, |e| matches!(e, Event::Close)).await;

    // offline: the retry cadence ticks without dialing
    sleep(Duration::from_millis(400)).await;
    assert_eq!(server.connection_count(), 1, "offline must not dial");
    assert!(!transport.state().is_connected());

    transport.set_online(true);
    wait_for(&mut events, |e| matches!(e, Event::Open)).await;
    assert_eq!(server.connection_count(), 2);

    transport.destroy();
}

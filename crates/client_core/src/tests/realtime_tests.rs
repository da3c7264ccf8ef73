use std::sync::atomic::Ordering;

use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use serde_json::json;
use shared::protocol::MemberSummary;
use tokio::net::TcpListener;

use super::*;
use crate::test_support::{eventually, record, signed_in, FakeAuth, FakeConnector, FakeMessageApi, Journal};

const ROOM: RoomId = RoomId(1);
const NEXT_ROOM: RoomId = RoomId(2);

struct Harness {
    journal: Journal,
    auth: Arc<FakeAuth>,
    api: Arc<FakeMessageApi>,
    connector: Arc<FakeConnector>,
    engine: Arc<ReconciliationEngine>,
    supervisor: Arc<ChannelSupervisor>,
    events: broadcast::Receiver<ClientEvent>,
}

async fn harness() -> Harness {
    let journal = Journal::default();
    let auth = FakeAuth::new();
    let session = signed_in(auth.clone()).await;
    let api = FakeMessageApi::new(journal.clone());
    api.set_history(ROOM, vec![record(1, 1, 10, 10)]);
    api.set_history(NEXT_ROOM, vec![record(50, 2, 10, 10)]);
    let connector = FakeConnector::new(journal.clone());
    let engine = ReconciliationEngine::new(api.clone());
    let (events, receiver) = broadcast::channel(1024);
    let supervisor = ChannelSupervisor::new(
        connector.clone(),
        session,
        Arc::clone(&engine),
        ReconnectPolicy::default(),
        events,
    );
    Harness {
        journal,
        auth,
        api,
        connector,
        engine,
        supervisor,
        events: receiver,
    }
}

async fn wait_for_status(supervisor: &ChannelSupervisor, status: ConnectionStatus) {
    eventually(move || async move { supervisor.status() == status }).await;
}

async fn next_reconnect(events: &mut broadcast::Receiver<ClientEvent>) -> (u32, Duration) {
    loop {
        if let ClientEvent::ReconnectScheduled { attempt, delay } =
            events.recv().await.expect("event stream open")
        {
            return (attempt, delay);
        }
    }
}

fn event(topic: &str, payload: serde_json::Value) -> ServerFrame {
    ServerFrame::Event {
        topic: topic.to_string(),
        payload,
    }
}

fn update_payload(room: RoomId) -> serde_json::Value {
    json!({
        "room_id": room.0,
        "sender_id": 10,
        "sender_name": "bob",
        "content": "hi",
        "sent_at": "2024-01-01T00:00:00Z",
        "kind": "text",
    })
}

#[test]
fn backoff_doubles_and_caps() {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
    let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    assert_eq!(backoff.attempt(), 7);

    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_secs(1));
}

#[test]
fn only_connected_is_healthy() {
    assert!(!ConnectionStatus::Connected.is_degraded());
    assert!(ConnectionStatus::Connecting.is_degraded());
    assert!(ConnectionStatus::Reconnecting.is_degraded());
    assert!(ConnectionStatus::Disconnected.is_degraded());
}

#[test]
fn websocket_url_follows_server_scheme() {
    let plain = WsConnector::from_server_url("http://127.0.0.1:8443").expect("http");
    assert_eq!(plain.url().as_str(), "ws://127.0.0.1:8443/ws");
    let secure = WsConnector::from_server_url("https://chat.example/api").expect("https");
    assert_eq!(secure.url().as_str(), "wss://chat.example/ws");
    assert!(matches!(
        WsConnector::from_server_url("ftp://chat.example"),
        Err(ClientError::Config(_))
    ));
}

#[tokio::test]
async fn snapshot_follows_handshake_and_precedes_subscriptions() {
    let h = harness().await;
    let _connection = h.connector.accept();

    assert_eq!(h.supervisor.status(), ConnectionStatus::Disconnected);
    h.supervisor.connect(ROOM).await;
    wait_for_status(&h.supervisor, ConnectionStatus::Connected).await;

    let order: Vec<usize> = [
        "connect",
        "authenticate",
        "fetch_history:1",
        "subscribe:global",
        "subscribe:room:1",
        "subscribe:roster",
    ]
    .iter()
    .map(|entry| h.journal.position(entry).expect(entry))
    .collect();
    assert!(order.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", h.journal.entries());
    assert_eq!(h.engine.current_messages().await.len(), 1);
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn consecutive_drops_back_off_exponentially() {
    let mut h = harness().await;
    for _ in 0..3 {
        drop(h.connector.accept());
    }

    h.supervisor.connect(ROOM).await;
    let scheduled: Vec<(u32, Duration)> = vec![
        next_reconnect(&mut h.events).await,
        next_reconnect(&mut h.events).await,
        next_reconnect(&mut h.events).await,
    ];

    assert_eq!(
        scheduled,
        vec![
            (1, Duration::from_secs(1)),
            (2, Duration::from_secs(2)),
            (3, Duration::from_secs(4)),
        ]
    );
    let attempts = h.connector.attempts();
    let gaps: Vec<Duration> = attempts.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert_eq!(gaps[..2], [Duration::from_secs(1), Duration::from_secs(2)]);
    assert_eq!(h.supervisor.status(), ConnectionStatus::Reconnecting);
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stable_connection_resets_backoff() {
    let mut h = harness().await;
    drop(h.connector.accept());
    drop(h.connector.accept());
    let stable = h.connector.accept();

    h.supervisor.connect(ROOM).await;
    assert_eq!(next_reconnect(&mut h.events).await.1, Duration::from_secs(1));
    assert_eq!(next_reconnect(&mut h.events).await.1, Duration::from_secs(2));
    wait_for_status(&h.supervisor, ConnectionStatus::Connected).await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    drop(stable);

    assert_eq!(
        next_reconnect(&mut h.events).await,
        (1, Duration::from_secs(1))
    );
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn resume_while_connected_makes_next_drop_reconnect_at_once() {
    let mut h = harness().await;
    drop(h.connector.accept());
    drop(h.connector.accept());
    let live = h.connector.accept();

    h.supervisor.connect(ROOM).await;
    assert_eq!(next_reconnect(&mut h.events).await.1, Duration::from_secs(1));
    assert_eq!(next_reconnect(&mut h.events).await.1, Duration::from_secs(2));
    wait_for_status(&h.supervisor, ConnectionStatus::Connected).await;

    h.supervisor.notify_foreground(Duration::from_secs(60)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let dropped_at = tokio::time::Instant::now();
    drop(live);

    // The immediate attempt is refused; backoff starts over from the base delay.
    assert_eq!(
        next_reconnect(&mut h.events).await,
        (1, Duration::from_secs(1))
    );
    let attempts = h.connector.attempts();
    assert_eq!(attempts.len(), 4);
    assert!(attempts[3] - dropped_at < Duration::from_millis(100));
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn foreground_resume_skips_backoff_wait() {
    let mut h = harness().await;

    h.supervisor.connect(ROOM).await;
    assert_eq!(next_reconnect(&mut h.events).await.1, Duration::from_secs(1));
    assert_eq!(next_reconnect(&mut h.events).await.1, Duration::from_secs(2));

    // Short background stints do not count as a resume.
    h.supervisor.notify_foreground(Duration::from_secs(2)).await;
    assert_eq!(next_reconnect(&mut h.events).await.1, Duration::from_secs(4));
    let before = h.connector.attempts().len();

    h.supervisor.notify_foreground(Duration::from_secs(60)).await;
    assert_eq!(
        next_reconnect(&mut h.events).await,
        (1, Duration::from_secs(1))
    );

    let attempts = h.connector.attempts();
    assert_eq!(attempts.len(), before + 1);
    assert_eq!(attempts[before], attempts[before - 1]);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn room_switch_unsubscribes_before_resubscribing() {
    let h = harness().await;
    let _connection = h.connector.accept();
    h.supervisor.connect(ROOM).await;
    wait_for_status(&h.supervisor, ConnectionStatus::Connected).await;

    h.supervisor.switch_room(NEXT_ROOM).await;

    let last_unsubscribe = ["unsubscribe:global", "unsubscribe:room:1", "unsubscribe:roster"]
        .iter()
        .map(|entry| h.journal.position(entry).expect(entry))
        .max()
        .expect("unsubscribes");
    let snapshot = h.journal.position("fetch_history:2").expect("snapshot");
    let resubscribe = h.journal.position("subscribe:room:2").expect("resubscribe");
    assert!(last_unsubscribe < snapshot && snapshot < resubscribe, "{:?}", h.journal.entries());
    assert_eq!(h.journal.count("subscribe:global"), 2);

    let messages = h.engine.current_messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].room_id, NEXT_ROOM);
    assert_eq!(h.engine.active_room().await, Some(NEXT_ROOM));
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn room_switch_without_channel_still_loads_snapshot() {
    let h = harness().await;

    h.supervisor.switch_room(NEXT_ROOM).await;

    assert_eq!(h.engine.active_room().await, Some(NEXT_ROOM));
    assert_eq!(h.engine.current_messages().await.len(), 1);
    assert!(h.journal.position("connect").is_none());
}

#[tokio::test]
async fn update_event_triggers_delta_refresh() {
    let h = harness().await;
    let connection = h.connector.accept();
    h.supervisor.connect(ROOM).await;
    wait_for_status(&h.supervisor, ConnectionStatus::Connected).await;
    h.api.push_history(ROOM, record(2, 1, 10, 20));

    connection
        .events
        .send(event("room:1", update_payload(ROOM)))
        .expect("deliver");

    let engine = Arc::clone(&h.engine);
    eventually(|| {
        let engine = Arc::clone(&engine);
        async move { engine.current_messages().await.len() == 2 }
    })
    .await;
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn malformed_payload_is_dropped_and_channel_stays_up() {
    let h = harness().await;
    let connection = h.connector.accept();
    h.supervisor.connect(ROOM).await;
    wait_for_status(&h.supervisor, ConnectionStatus::Connected).await;
    let fetches = h.api.history_calls.load(Ordering::SeqCst);

    connection
        .events
        .send(event("room:1", json!({ "unexpected": true })))
        .expect("deliver");
    connection
        .events
        .send(event("room:99", update_payload(RoomId(99))))
        .expect("deliver");
    h.api.push_history(ROOM, record(2, 1, 10, 20));
    connection
        .events
        .send(event("global", update_payload(ROOM)))
        .expect("deliver");

    let engine = Arc::clone(&h.engine);
    eventually(|| {
        let engine = Arc::clone(&engine);
        async move { engine.current_messages().await.len() == 2 }
    })
    .await;
    assert_eq!(h.api.history_calls.load(Ordering::SeqCst), fetches + 1);
    assert_eq!(h.supervisor.status(), ConnectionStatus::Connected);
    assert_eq!(h.connector.attempts().len(), 1);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn roster_event_is_rebroadcast() {
    let mut h = harness().await;
    let connection = h.connector.accept();
    h.supervisor.connect(ROOM).await;
    wait_for_status(&h.supervisor, ConnectionStatus::Connected).await;
    let members = vec![MemberSummary {
        room_id: ROOM,
        user_id: UserId(10),
        display_name: "bob".into(),
    }];

    connection
        .events
        .send(event(
            "roster",
            json!({ "room_id": 1, "members": serde_json::to_value(&members).expect("encode") }),
        ))
        .expect("deliver");

    loop {
        match h.events.recv().await.expect("event") {
            ClientEvent::RosterUpdated {
                room_id,
                members: received,
            } => {
                assert_eq!(room_id, ROOM);
                assert_eq!(received.len(), 1);
                assert_eq!(received[0].display_name, "bob");
                break;
            }
            _ => continue,
        }
    }
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_handshake_refreshes_credential_then_reconnects() {
    let h = harness().await;
    let _rejected = h.connector.accept_then_reject_auth();
    let _accepted = h.connector.accept();

    h.supervisor.connect(ROOM).await;
    wait_for_status(&h.supervisor, ConnectionStatus::Connected).await;

    assert_eq!(h.auth.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.connector.attempts().len(), 2);
    assert_eq!(h.journal.count("fetch_history:1"), 1);
    h.supervisor.shutdown().await;
}

#[tokio::test]
async fn shutdown_tears_down_and_is_terminal() {
    let h = harness().await;
    let _connection = h.connector.accept();
    let mut status = h.supervisor.subscribe_status();
    h.supervisor.connect(ROOM).await;
    wait_for_status(&h.supervisor, ConnectionStatus::Connected).await;

    h.supervisor.shutdown().await;

    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Disconnected);
    let entries = h.journal.entries();
    let unsubscribed = entries
        .iter()
        .position(|entry| entry == "unsubscribe:roster")
        .expect("unsubscribed");
    let closed = entries.iter().position(|entry| entry == "close").expect("closed");
    assert!(unsubscribed < closed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.supervisor.status(), ConnectionStatus::Disconnected);
    assert_eq!(h.connector.attempts().len(), 1);
}

async fn scripted_ws(socket: WebSocket, received: mpsc::UnboundedSender<String>) {
    let mut socket = socket;
    let _ = socket.send(WsMessage::Text("{not json".into())).await;
    let frame = serde_json::to_string(&ServerFrame::Authenticated { subject: UserId(5) })
        .expect("encode frame");
    let _ = socket.send(WsMessage::Text(frame)).await;
    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            let _ = received.send(text);
        }
    }
}

#[tokio::test]
async fn websocket_connection_skips_malformed_frames() {
    let (received_tx, mut received_rx) = mpsc::unbounded_channel();
    let app = Router::new().route(
        "/ws",
        get(move |upgrade: WebSocketUpgrade| {
            let received_tx = received_tx.clone();
            async move {
                let response: Response =
                    upgrade.on_upgrade(move |socket| scripted_ws(socket, received_tx));
                response
            }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let connector = WsConnector::from_server_url(&format!("http://{addr}")).expect("url");
    let mut connection = connector.connect().await.expect("connect");
    connection
        .send(ClientFrame::Authenticate {
            access_token: "token-5".into(),
        })
        .await
        .expect("send");

    let frame = connection.recv().await.expect("recv").expect("frame");
    assert!(matches!(frame, ServerFrame::Authenticated { subject } if subject == UserId(5)));
    let sent = received_rx.recv().await.expect("server saw frame");
    assert!(sent.contains("\"type\":\"authenticate\""), "{sent}");
    connection.close().await.expect("close");
}

//! End-to-end negotiation over an in-process relay.
//!
//! The relay mirrors the production one: every envelope received on a
//! booking's websocket is fanned out to the whole group, sender included.
//! Media never touches it: once negotiation completes, ICE runs over
//! loopback host candidates (no STUN configured).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio::time::{sleep, timeout};

use chambers_client_core::config::Config;
use chambers_client_core::media::SyntheticCapture;
use chambers_client_core::peer::ConnectionState;
use chambers_client_core::session::{SessionIdentity, SessionOrchestrator};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Default)]
struct RelayState {
    rooms: Arc<AsyncMutex<HashMap<String, broadcast::Sender<String>>>>,
}

async fn spawn_relay() -> SocketAddr {
    let app = Router::new()
        .route("/ws/video_session/:booking_id/", get(relay_upgrade))
        .with_state(RelayState::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let addr = listener.local_addr().expect("relay addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("relay serve");
    });
    addr
}

async fn relay_upgrade(
    ws: WebSocketUpgrade,
    Path(booking_id): Path<String>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay_session(socket, booking_id, state))
}

async fn relay_session(socket: WebSocket, booking_id: String, state: RelayState) {
    let group = {
        let mut rooms = state.rooms.lock().await;
        rooms
            .entry(booking_id)
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    };
    let mut group_rx = group.subscribe();
    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            inbound = read.next() => {
                match inbound {
                    // Group send: everyone in the booking, sender included.
                    Some(Ok(WsMessage::Text(text))) => { let _ = group.send(text); }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            outbound = group_rx.recv() => {
                match outbound {
                    Ok(text) => {
                        if write.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
        }
    }
}

fn relay_config(addr: SocketAddr) -> Config {
    Config {
        relay_url: format!("http://{addr}"),
        stun_servers: Vec::new(),
    }
}

async fn start_participant(addr: SocketAddr, booking: &str, name: &str) -> SessionOrchestrator {
    SessionOrchestrator::start(
        &relay_config(addr),
        SessionIdentity::new(booking, name),
        Arc::new(SyntheticCapture::new()),
    )
    .await
}

async fn wait_for_connected(session: &SessionOrchestrator) {
    let mut state = session.connection_state();
    timeout(CONNECT_TIMEOUT, async {
        loop {
            if *state.borrow_and_update() == ConnectionState::Connected {
                return;
            }
            state.changed().await.expect("state stream ended");
        }
    })
    .await
    .expect("negotiation did not reach Connected in time");
}

async fn wait_for_chat_len(session: &SessionOrchestrator, len: usize) {
    timeout(Duration::from_secs(10), async {
        while session.chat().len() < len {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("chat message did not arrive in time");
}

/// Passive group member that records everything the relay fans out.
struct Spy {
    frames: Arc<AsyncMutex<Vec<Value>>>,
}

impl Spy {
    async fn join(addr: SocketAddr, booking: &str) -> Self {
        let url = format!("ws://{addr}/ws/video_session/{booking}/");
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .expect("spy connect");
        let frames: Arc<AsyncMutex<Vec<Value>>> = Arc::default();
        let sink = Arc::clone(&frames);
        tokio::spawn(async move {
            let (_, mut read) = ws.split();
            while let Some(Ok(msg)) = read.next().await {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        sink.lock().await.push(value);
                    }
                }
            }
        });
        Self { frames }
    }

    async fn count(&self, kind: &str) -> usize {
        self.frames
            .lock()
            .await
            .iter()
            .filter(|v| v.get("type").and_then(Value::as_str) == Some(kind))
            .count()
    }
}

/// Inject one raw frame into the booking group and disconnect.
async fn send_raw(addr: SocketAddr, booking: &str, text: &str) {
    let url = format!("ws://{addr}/ws/video_session/{booking}/");
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .expect("raw connect");
    ws.send(tokio_tungstenite::tungstenite::Message::Text(
        text.to_string(),
    ))
    .await
    .expect("raw send");
    // Give the relay a moment to fan out before the socket drops.
    sleep(Duration::from_millis(50)).await;
    let _ = ws.close(None).await;
}

#[tokio::test]
async fn offer_answer_and_trickled_candidates_reach_connected() {
    let addr = spawn_relay().await;
    let caller = start_participant(addr, "101", "Client").await;
    let callee = start_participant(addr, "101", "Advocate").await;

    caller.start_session().await.expect("start session");

    wait_for_connected(&caller).await;
    wait_for_connected(&callee).await;

    // Both sides hold one audio and one video sender; the callee acquired
    // media on demand when the offer arrived.
    assert_eq!(caller.attached_tracks().await, 2);
    assert_eq!(callee.attached_tracks().await, 2);

    caller.close().await;
    callee.close().await;
}

#[tokio::test]
async fn chat_round_trip_preserves_fields_and_appends_once_per_delivery() {
    let addr = spawn_relay().await;
    let caller = start_participant(addr, "102", "Client").await;
    let callee = start_participant(addr, "102", "Advocate").await;

    // Chat is multiplexed over the signaling channel and independent of
    // negotiation state: no call has been started here.
    caller.send_chat("hello");
    wait_for_chat_len(&callee, 1).await;
    wait_for_chat_len(&caller, 1).await;

    let received = &callee.chat().snapshot()[0];
    assert_eq!(received.text, "hello");
    assert_eq!(received.sender_id, caller.identity().participant_id);
    assert_eq!(received.sender_name, "Client");

    // The sender's log is fed by the relay echo, so both logs hold the
    // identical message, timestamp included.
    let echoed = &caller.chat().snapshot()[0];
    assert_eq!(echoed, received);

    callee.send_chat("hi there");
    wait_for_chat_len(&caller, 2).await;
    assert_eq!(caller.chat().snapshot()[1].text, "hi there");

    caller.close().await;
    callee.close().await;
}

#[tokio::test]
async fn duplicate_start_session_emits_exactly_one_offer() {
    let addr = spawn_relay().await;
    let spy = Spy::join(addr, "103").await;
    let caller = start_participant(addr, "103", "Client").await;

    caller.start_session().await.expect("first start");
    caller.start_session().await.expect("duplicate start");
    sleep(Duration::from_millis(500)).await;

    assert_eq!(spy.count("offer").await, 1);
    caller.close().await;
}

#[tokio::test]
async fn simultaneous_offers_resolve_to_exactly_one_answerer() {
    let addr = spawn_relay().await;
    let spy = Spy::join(addr, "104").await;
    let a = start_participant(addr, "104", "Client").await;
    let b = start_participant(addr, "104", "Advocate").await;

    let (ra, rb) = tokio::join!(a.start_session(), b.start_session());
    ra.expect("a start");
    rb.expect("b start");

    wait_for_connected(&a).await;
    wait_for_connected(&b).await;

    // Whatever the interleaving, the id tie-break leaves exactly one side
    // answering.
    assert_eq!(spy.count("answer").await, 1);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn protocol_noise_does_not_disturb_a_session() {
    let addr = spawn_relay().await;
    let caller = start_participant(addr, "105", "Client").await;
    let callee = start_participant(addr, "105", "Advocate").await;

    send_raw(addr, "105", "not json at all").await;
    send_raw(addr, "105", r#"{"type":"screen_share","payload":{}}"#).await;
    send_raw(addr, "105", r#"{"type":"chat_message","payload":{"text":42}}"#).await;

    caller.start_session().await.expect("start session");
    wait_for_connected(&caller).await;
    wait_for_connected(&callee).await;

    // The malformed chat frame was dropped, not appended.
    assert!(callee.chat().is_empty());

    caller.close().await;
    callee.close().await;
}

#[tokio::test]
async fn mute_toggle_changes_neither_state_nor_track_set() {
    let addr = spawn_relay().await;
    let caller = start_participant(addr, "106", "Client").await;
    let callee = start_participant(addr, "106", "Advocate").await;

    caller.start_session().await.expect("start session");
    wait_for_connected(&caller).await;

    let tracks_before = caller.attached_tracks().await;
    caller.set_audio_enabled(true).await;
    assert!(caller.audio_enabled().await);
    caller.set_audio_enabled(false).await;
    assert!(!caller.audio_enabled().await);

    // Only the enabled gate moved: same senders, same state.
    assert_eq!(caller.attached_tracks().await, tracks_before);
    assert_eq!(
        *caller.connection_state().borrow(),
        ConnectionState::Connected
    );

    caller.close().await;
    callee.close().await;
}

#[tokio::test]
async fn teardown_mid_negotiation_is_clean_and_idempotent() {
    let addr = spawn_relay().await;
    let caller = start_participant(addr, "107", "Client").await;

    // No counterpart: the offer never gets answered.
    caller.start_session().await.expect("start session");
    sleep(Duration::from_millis(100)).await;

    caller.close().await;
    caller.close().await;
    assert!(matches!(
        caller.start_session().await,
        Err(chambers_client_core::session::SessionError::Closed)
    ));
}

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::{timeout, Instant};

use huddle_broker::registry::{RegistryConfig, RoomRegistry};
use huddle_broker::server;
use huddle_client::session::{ClientSession, SessionEvent};
use huddle_client::transport::WsTransport;
use huddle_common::room::RoomName;

async fn start_broker() -> (String, Arc<RoomRegistry>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
    let addr = listener.local_addr().expect("listener should expose local address");

    let registry = Arc::new(RoomRegistry::new(None, RegistryConfig::default()));
    let app = server::router(Arc::clone(&registry));
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("broker should serve");
    });

    (format!("ws://{addr}/ws"), registry, server_task)
}

async fn join(base: &str, room: &RoomName, session: &mut ClientSession) -> WsTransport {
    let user_id = session.user().id.clone();
    let mut transport = WsTransport::connect(base, room, &user_id, session.replica_id())
        .await
        .expect("client should connect");
    for frame in session.hello_frames().expect("hello frames should encode") {
        transport.send(frame).await.expect("hello frame should send");
    }
    transport
}

/// Receive one frame, run it through the session, and send any replies
/// (e.g. a step-2 answering the broker's step-1).
async fn pump(transport: &mut WsTransport, session: &mut ClientSession) -> Vec<SessionEvent> {
    let frame = timeout(Duration::from_secs(2), transport.recv())
        .await
        .expect("timed out waiting for a websocket frame")
        .expect("websocket read should succeed")
        .expect("websocket should remain open");

    let output = session.handle_frame(&frame).expect("frame should be handled");
    for reply in output.replies {
        transport.send(reply).await.expect("reply should send");
    }
    output.events
}

/// Pump until `done` returns true or the deadline passes.
async fn pump_until<F>(
    transport: &mut WsTransport,
    session: &mut ClientSession,
    mut done: F,
    failure: &str,
) -> Vec<SessionEvent>
where
    F: FnMut(&ClientSession, &[SessionEvent]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut collected = Vec::new();
    loop {
        if done(session, &collected) {
            return collected;
        }
        assert!(Instant::now() < deadline, "{failure}");
        let events = pump(transport, session).await;
        collected.extend(events);
    }
}

#[tokio::test]
async fn two_clients_converge_and_see_each_other() {
    let (base, registry, server_task) = start_broker().await;
    let room_name = RoomName::parse("CONVERGE").expect("room name should parse");

    let mut alice = ClientSession::new("alice", "Alice");
    alice.insert("main", 0, "hello from alice");
    let mut alice_ws = join(&base, &room_name, &mut alice).await;

    // The broker's step-1 arrives first; answering it uploads alice's
    // text. Wait for the room to hold it before bob joins.
    pump(&mut alice_ws, &mut alice).await;
    let room = registry.get_or_create(&room_name).await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while room.text("file:main").await != "hello from alice" {
        assert!(Instant::now() < deadline, "broker did not absorb alice's step-2");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut bob = ClientSession::new("bob", "Bob");
    let mut bob_ws = join(&base, &room_name, &mut bob).await;

    // Bob catches up through the handshake and learns about alice from
    // the awareness snapshot sent on attach.
    pump_until(
        &mut bob_ws,
        &mut bob,
        |session, _| {
            session.file_text("main") == "hello from alice" && !session.peers().is_empty()
        },
        "bob did not reach alice's document state",
    )
    .await;
    assert_eq!(bob.peers()[0].user_id, "alice");

    // A live edit from bob reaches alice as a broadcast update.
    let edit = bob.insert("main", 16, " + bob");
    bob_ws.send(edit).await.expect("bob's edit should send");

    pump_until(
        &mut alice_ws,
        &mut alice,
        |session, _| session.file_text("main") == "hello from alice + bob",
        "alice did not receive bob's broadcast update",
    )
    .await;
    assert_eq!(alice.file_text("main"), bob.file_text("main"));

    alice_ws.close().await;
    bob_ws.close().await;
    server_task.abort();
}

#[tokio::test]
async fn signals_are_relayed_with_the_sender_identity() {
    let (base, _registry, server_task) = start_broker().await;
    let room_name = RoomName::parse("SIGNALS1").expect("room name should parse");

    let mut alice = ClientSession::new("alice", "Alice");
    let mut alice_ws = join(&base, &room_name, &mut alice).await;
    pump(&mut alice_ws, &mut alice).await;

    let mut bob = ClientSession::new("bob", "Bob");
    let mut bob_ws = join(&base, &room_name, &mut bob).await;
    // Wait until bob is attached and visible to the room before
    // addressing a signal through it.
    pump_until(
        &mut alice_ws,
        &mut alice,
        |session, _| !session.peers().is_empty(),
        "alice never saw bob join",
    )
    .await;

    let payload = r#"{"type":"voice-offer","sdp":"v=0 test"}"#;
    let frame = bob.signal_frame("alice", payload);
    bob_ws.send(frame).await.expect("bob's signal should send");

    let events = pump_until(
        &mut alice_ws,
        &mut alice,
        |_, events| {
            events.iter().any(|event| matches!(event, SessionEvent::Signal { .. }))
        },
        "alice did not receive the relayed signal",
    )
    .await;

    let signal = events
        .iter()
        .find_map(|event| match event {
            SessionEvent::Signal { from, payload } => Some((from.clone(), payload.clone())),
            _ => None,
        })
        .expect("a signal event should be present");
    assert_eq!(signal.0, "bob", "the broker must rewrite the address to the sender");
    assert_eq!(signal.1, payload, "the payload must pass through untouched");

    alice_ws.close().await;
    bob_ws.close().await;
    server_task.abort();
}

#[tokio::test]
async fn awareness_removal_reaches_peers_when_a_client_disconnects() {
    let (base, _registry, server_task) = start_broker().await;
    let room_name = RoomName::parse("GOODBYE2").expect("room name should parse");

    let mut alice = ClientSession::new("alice", "Alice");
    let mut alice_ws = join(&base, &room_name, &mut alice).await;
    pump(&mut alice_ws, &mut alice).await;

    let mut bob = ClientSession::new("bob", "Bob");
    let bob_ws = join(&base, &room_name, &mut bob).await;

    pump_until(
        &mut alice_ws,
        &mut alice,
        |session, _| !session.peers().is_empty(),
        "alice never saw bob join",
    )
    .await;

    bob_ws.close().await;

    pump_until(
        &mut alice_ws,
        &mut alice,
        |session, _| session.peers().is_empty(),
        "alice never saw bob's awareness removal",
    )
    .await;

    alice_ws.close().await;
    server_task.abort();
}

#[tokio::test]
async fn invalid_room_names_are_rejected_at_the_door() {
    let (base, _registry, server_task) = start_broker().await;

    let result = tokio_tungstenite::connect_async(format!("{base}?room=nope")).await;
    assert!(result.is_err(), "a five character room name must not upgrade");

    let result = tokio_tungstenite::connect_async(format!("{base}?room=bad%20name")).await;
    assert!(result.is_err(), "a room name with a space must not upgrade");

    server_task.abort();
}

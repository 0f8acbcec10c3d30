// WebSocket endpoint and health route.
//
// Each connection joins exactly one room, identified by the `room`
// query parameter. On attach the broker sends a sync step-1 (its state
// vector) followed by the room's current awareness snapshot; after
// that, frames flow through `handle_frame`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use huddle_common::protocol::{SyncFrame, WireMessage};
use huddle_common::room::RoomName;

use crate::registry::{Peer, Room, RoomRegistry};

#[derive(Clone)]
pub struct AppState {
    registry: Arc<RoomRegistry>,
    next_conn_id: Arc<AtomicU64>,
}

pub fn router(registry: Arc<RoomRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(AppState { registry, next_conn_id: Arc::new(AtomicU64::new(1)) })
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": state.registry.room_count().await,
    }))
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    room: String,
    #[serde(rename = "userId", default = "anonymous_user")]
    user_id: String,
    /// The client's CRDT client id; used to clean up its awareness
    /// entry when the connection dies.
    #[serde(rename = "clientId", default)]
    client_id: u64,
}

fn anonymous_user() -> String {
    "anonymous".to_string()
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let room_name = match RoomName::parse(&params.room) {
        Ok(name) => name,
        Err(error) => {
            debug!(room = %params.room, error = %error, "rejecting connection with bad room name");
            return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
        }
    };

    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    ws.on_upgrade(move |socket| handle_socket(state.registry, socket, room_name, params, conn_id))
        .into_response()
}

async fn handle_socket(
    registry: Arc<RoomRegistry>,
    mut socket: WebSocket,
    room_name: RoomName,
    params: ConnectParams,
    conn_id: u64,
) {
    let room = registry.get_or_create(&room_name).await;

    let (sender, mut outbound) = mpsc::unbounded_channel::<Vec<u8>>();
    room.add_peer(
        conn_id,
        Peer { user_id: params.user_id.clone(), replica_id: params.client_id, sender },
    )
    .await;
    let peers = room.peer_count().await;
    info!(room = %room_name, user_id = %params.user_id, peers, "client connected");

    let attached = attach(&room, &mut socket).await;

    if attached {
        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    if socket.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                incoming = socket.recv() => {
                    let Some(Ok(message)) = incoming else { break };
                    match message {
                        Message::Binary(payload) => {
                            match handle_frame(&room, conn_id, &params.user_id, payload.as_ref()).await {
                                Ok(Some(reply)) => {
                                    if socket.send(Message::Binary(reply.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(None) => {}
                                Err(error) => {
                                    // One bad frame does not kill the
                                    // connection or the room.
                                    warn!(
                                        room = %room_name,
                                        user_id = %params.user_id,
                                        error = %error,
                                        "dropping unprocessable frame"
                                    );
                                }
                            }
                        }
                        Message::Ping(payload) => {
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        Message::Text(_) | Message::Pong(_) => {}
                    }
                }
            }
        }
    }

    disconnect(&registry, &room, conn_id, params.client_id, &params.user_id).await;
}

/// Initial frames for a fresh connection: step-1 with the room's state
/// vector, then the awareness snapshot so the joiner sees existing
/// cursors immediately.
async fn attach(room: &Arc<Room>, socket: &mut WebSocket) -> bool {
    let step1 = WireMessage::Sync(SyncFrame::Step1(room.state_vector().await)).encode();
    if socket.send(Message::Binary(step1.into())).await.is_err() {
        return false;
    }

    if let Some(snapshot) = room.awareness_snapshot().await {
        let frame = WireMessage::Awareness(snapshot).encode();
        if socket.send(Message::Binary(frame.into())).await.is_err() {
            return false;
        }
    }

    true
}

async fn disconnect(
    registry: &Arc<RoomRegistry>,
    room: &Arc<Room>,
    conn_id: u64,
    replica_id: u64,
    user_id: &str,
) {
    let remaining = room.remove_peer(conn_id).await;

    if let Some(removal) = room.remove_awareness(replica_id).await {
        room.broadcast_except(conn_id, &WireMessage::Awareness(removal).encode()).await;
    }

    info!(room = %room.name(), user_id = %user_id, peers = remaining, "client disconnected");

    if remaining == 0 {
        registry.release(room.name()).await;
    }
}

/// Dispatch one inbound binary frame. Returns an optional direct reply
/// for the sending connection; fan-out to other peers happens inside.
pub async fn handle_frame(
    room: &Arc<Room>,
    conn_id: u64,
    user_id: &str,
    payload: &[u8],
) -> anyhow::Result<Option<Vec<u8>>> {
    match WireMessage::decode(payload)? {
        WireMessage::Sync(SyncFrame::Step1(state_vector)) => {
            let diff = room.diff_since(&state_vector).await?;
            Ok(Some(WireMessage::Sync(SyncFrame::Step2(diff)).encode()))
        }
        WireMessage::Sync(SyncFrame::Step2(update)) => {
            // The client's answer to our step-1; merge, no fan-out.
            room.apply_sync_update(&update).await?;
            Ok(None)
        }
        WireMessage::Sync(SyncFrame::Update(update)) => {
            room.apply_sync_update(&update).await?;
            // Forward the exact bytes received; receivers merge
            // idempotently, so duplicates are harmless.
            room.broadcast_except(conn_id, payload).await;
            Ok(None)
        }
        WireMessage::Awareness(delta) => {
            room.apply_awareness(&delta).await?;
            room.broadcast_except(conn_id, payload).await;
            Ok(None)
        }
        WireMessage::Signal { peer, payload: signal } => {
            // Rewrite the address field so the receiver learns who is
            // calling, then hand the payload over untouched.
            let frame =
                WireMessage::Signal { peer: user_id.to_string(), payload: signal }.encode();
            if !room.send_to_user(conn_id, &peer, frame).await {
                debug!(room = %room.name(), target = %peer, "signal target not connected, dropped");
            }
            Ok(None)
        }
    }
}

//! WebSocket v3 Transport (§4.6): one `/ws` endpoint per client connection. A reader loop
//! decodes frames and routes SUBSCRIBE/UNSUBSCRIBE/INPUT_TEXT/RESIZE into the Hub and
//! Registry; a single writer task owns the socket and drains a shared outbound channel fed
//! by one "pump" task per (connection, session) subscription. The pump design keeps each
//! session's back-pressure handling (already inside `Hub`/`OutboundQueue`) independent of
//! the single physical socket's single-writer requirement.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use common::error::VtError;
use common::hub::{ConnectionId, Subscriber};
use common::session::SessionId;
use common::wsframe::{flags, Frame, FrameType};

use crate::web_server::{bearer_token, AppState};

const MAX_CONSECUTIVE_PROTOCOL_ERRORS: u32 = 3;
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Sentinel session id a client SUBSCRIBEs to with an empty `session_id` (§4.6: "Empty
/// session_id with Events subscribes to global events"). Registered in the Hub exactly
/// like any other session id so `Hub::publish_global_event`'s existing fan-out (it already
/// iterates every session's subscriber set) reaches it without any change to `hub.rs`.
fn global_session_id() -> SessionId {
    SessionId(Uuid::nil())
}

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer_token(&headers).or(query.token.as_deref());
    if !state.auth.verify(&state.config, token) {
        return (StatusCode::UNAUTHORIZED, Json(VtError::Unauthenticated.to_body())).into_response();
    }
    let connection_id = state.registry.next_connection_id();
    ws.on_upgrade(move |socket| handle_connection(socket, state, connection_id))
}

async fn handle_connection(socket: WebSocket, state: AppState, connection_id: ConnectionId) {
    info!(connection_id = connection_id.0, "websocket connected");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CHANNEL_CAPACITY);

    let welcome = Frame::welcome(serde_json::json!({
        "serverVersion": 3,
        "capabilities": ["stdout", "snapshots", "events"],
    }));
    let _ = out_tx.send(Message::Binary(welcome.encode())).await;

    let writer_task: JoinHandle<()> = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let pumps: Arc<DashMap<SessionId, JoinHandle<()>>> = Arc::new(DashMap::new());
    // Woken by a pump when a subscriber's event queue overflows (§4.5); the reader loop below
    // observes it alongside the socket read so a per-session back-pressure violation still
    // tears down the whole connection, not just that pump.
    let terminate = Arc::new(Notify::new());
    let mut consecutive_protocol_errors = 0u32;
    let idle_timeout = state.config.idle_timeout;

    loop {
        let next = tokio::select! {
            res = tokio::time::timeout(idle_timeout, ws_rx.next()) => match res {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(_))) | Ok(None) => break,
                Err(_) => {
                    let _ = out_tx
                        .send(Message::Close(Some(CloseFrame { code: 1001, reason: "idle timeout".into() })))
                        .await;
                    break;
                }
            },
            _ = terminate.notified() => {
                warn!(connection_id = connection_id.0, "closing after event queue policy violation");
                break;
            }
        };

        match next {
            Message::Binary(bytes) => match Frame::decode(bytes) {
                Ok(frame) => {
                    consecutive_protocol_errors = 0;
                    handle_frame(frame, &state, connection_id, &out_tx, &pumps, &terminate).await;
                }
                Err(e) => {
                    consecutive_protocol_errors += 1;
                    send_error(&out_tx, "", &e).await;
                    if consecutive_protocol_errors >= MAX_CONSECUTIVE_PROTOCOL_ERRORS {
                        warn!(connection_id = connection_id.0, "closing after repeated protocol errors");
                        let _ = out_tx
                            .send(Message::Close(Some(CloseFrame { code: 1003, reason: "protocol error".into() })))
                            .await;
                        break;
                    }
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Text(_) => {
                consecutive_protocol_errors += 1;
                send_error(&out_tx, "", &VtError::ProtocolError("text frames are not supported".into())).await;
                if consecutive_protocol_errors >= MAX_CONSECUTIVE_PROTOCOL_ERRORS {
                    let _ = out_tx
                        .send(Message::Close(Some(CloseFrame { code: 1003, reason: "protocol error".into() })))
                        .await;
                    break;
                }
            }
        }
    }

    for entry in pumps.iter() {
        entry.value().abort();
    }
    state.registry.hub().drop_connection(connection_id);
    writer_task.abort();
    info!(connection_id = connection_id.0, "websocket disconnected");
}

async fn handle_frame(
    frame: Frame,
    state: &AppState,
    connection_id: ConnectionId,
    out_tx: &mpsc::Sender<Message>,
    pumps: &Arc<DashMap<SessionId, JoinHandle<()>>>,
    terminate: &Arc<Notify>,
) {
    match frame.frame_type {
        FrameType::Subscribe => handle_subscribe(frame, state, connection_id, out_tx, pumps, terminate).await,
        FrameType::Unsubscribe => handle_unsubscribe(frame, state, connection_id, pumps),
        FrameType::InputText => {
            let Some(session_id) = parse_or_error(&frame.session_id, out_tx).await else { return };
            if let Err(e) = state.registry.input(session_id, frame.payload.clone()).await {
                send_error(out_tx, &frame.session_id, &e).await;
            }
        }
        FrameType::Resize => {
            let Some(session_id) = parse_or_error(&frame.session_id, out_tx).await else { return };
            match frame.resize() {
                Ok(p) => {
                    if let Err(e) = state.registry.resize(session_id, p.cols, p.rows).await {
                        send_error(out_tx, &frame.session_id, &e).await;
                    }
                }
                Err(e) => send_error(out_tx, &frame.session_id, &e).await,
            }
        }
        FrameType::Ping => {
            let _ = out_tx.send(Message::Binary(Frame::pong().encode())).await;
        }
        FrameType::Pong => {}
        FrameType::Welcome | FrameType::Stdout | FrameType::SnapshotVt | FrameType::Event => {
            send_error(
                out_tx,
                &frame.session_id,
                &VtError::ProtocolError("server-to-client frame type received from client".into()),
            )
            .await;
        }
    }
}

async fn handle_subscribe(
    frame: Frame,
    state: &AppState,
    connection_id: ConnectionId,
    out_tx: &mpsc::Sender<Message>,
    pumps: &Arc<DashMap<SessionId, JoinHandle<()>>>,
    terminate: &Arc<Notify>,
) {
    let payload = match frame.subscribe() {
        Ok(p) => p,
        Err(e) => return send_error(out_tx, &frame.session_id, &e).await,
    };
    let session_id = if frame.session_id.is_empty() {
        global_session_id()
    } else {
        match frame.session_id.parse::<SessionId>() {
            Ok(id) => id,
            Err(_) => return send_error(out_tx, &frame.session_id, &VtError::NotFound(frame.session_id.clone())).await,
        }
    };
    if session_id != global_session_id() && state.registry.get(session_id).await.is_err() {
        return send_error(out_tx, &frame.session_id, &VtError::NotFound(frame.session_id.clone())).await;
    }

    let hub = state.registry.hub();
    let subscriber = hub.subscribe(session_id, connection_id, payload.interest, payload.snapshot_min_ms, payload.snapshot_max_ms);

    // "A snapshot is always emitted immediately on subscribe" (§4.5).
    if payload.interest & flags::SNAPSHOTS != 0 {
        if let Ok(snap) = state.registry.snapshot(session_id) {
            subscriber.queue.push_snapshot(Frame::snapshot(&frame.session_id, snap));
        }
    }

    spawn_pump(pumps, session_id, subscriber, out_tx.clone(), terminate.clone());
}

fn handle_unsubscribe(frame: Frame, state: &AppState, connection_id: ConnectionId, pumps: &Arc<DashMap<SessionId, JoinHandle<()>>>) {
    let session_id = if frame.session_id.is_empty() {
        global_session_id()
    } else {
        match frame.session_id.parse::<SessionId>() {
            Ok(id) => id,
            Err(_) => return,
        }
    };
    state.registry.hub().unsubscribe(session_id, connection_id);
    if let Some((_, handle)) = pumps.remove(&session_id) {
        handle.abort();
    }
}

/// Spawns the per-(connection, session) pump task if one isn't already running. SUBSCRIBE
/// is idempotent (§4.6); a repeated SUBSCRIBE returns the same `Subscriber`/queue, so the
/// existing pump already covers the updated interest flags.
fn spawn_pump(
    pumps: &Arc<DashMap<SessionId, JoinHandle<()>>>,
    session_id: SessionId,
    subscriber: Arc<Subscriber>,
    out_tx: mpsc::Sender<Message>,
    terminate: Arc<Notify>,
) {
    if pumps.contains_key(&session_id) {
        return;
    }
    let handle = tokio::spawn(async move {
        loop {
            let frames = subscriber.queue.wait_and_drain().await;
            for frame in frames {
                if out_tx.send(Message::Binary(frame.encode())).await.is_err() {
                    return;
                }
            }
            // §4.5: if the event queue is full, the connection is terminated with a
            // policy-violation close. The queue itself can't close the socket, so it flags
            // the overflow and the pump closes the shared connection on its behalf.
            if subscriber.queue.policy_violation() {
                let _ = out_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: 1008,
                        reason: "event queue overflow".into(),
                    })))
                    .await;
                terminate.notify_one();
                return;
            }
        }
    });
    pumps.insert(session_id, handle);
}

async fn parse_or_error(raw: &str, out_tx: &mpsc::Sender<Message>) -> Option<SessionId> {
    match raw.parse::<SessionId>() {
        Ok(id) => Some(id),
        Err(_) => {
            send_error(out_tx, raw, &VtError::NotFound(raw.to_string())).await;
            None
        }
    }
}

async fn send_error(out_tx: &mpsc::Sender<Message>, session_id: &str, err: &VtError) {
    let payload = serde_json::json!({"kind": "error", "code": err.code().as_str(), "reason": err.to_string()});
    let frame = Frame::event(session_id, payload);
    let _ = out_tx.send(Message::Binary(frame.encode())).await;
}

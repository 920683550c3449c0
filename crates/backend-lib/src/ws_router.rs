// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! WebSocket router and connection handling.
//!
//! One socket per participant per stream. Admission runs before any
//! frame processing: eligibility against the session document, then
//! registration with the room actor (the capacity serialization point),
//! then the attendance record. Outbound frames flow through a bounded
//! channel pumped by a dedicated task, so room fan-out never blocks on
//! this socket.

use crate::auth::Identity;
use crate::error::AppError;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use livecast_common::{
    ClientFrame, DenyReason, JoinDecision, LeaveReason, ServerFrame, SignalKind,
};
use metrics::{counter, gauge};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound queue depth per connection. Overflow drops frames rather
/// than stalling the room (at-most-once delivery).
const OUTBOUND_BUFFER: usize = 64;

#[derive(Deserialize)]
struct WsParams {
    token: String,
}

/// Create the WebSocket router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/{stream_id}", get(ws_handler))
        .with_state(state)
}

/// Authenticate, then upgrade. Auth failures are plain HTTP errors so
/// clients see a status code instead of a dropped upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(stream_id): Path<Uuid>,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let identity = state.identity.authenticate(&params.token).await?;

    counter!(crate::metrics::WS_CONNECTED).increment(1);
    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, stream_id, identity)))
}

fn error_frame(err: &AppError) -> ServerFrame {
    ServerFrame::Error {
        code: err.error_code().to_string(),
        message: err.to_string(),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) {
    if let Ok(json) = serde_json::to_string(frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}

/// Admission: eligibility check, room registration, attendance record.
/// Returns the outbound receiver end already wired into the room, plus
/// the registration generation this socket owns.
async fn admit(
    state: &AppState,
    stream_id: Uuid,
    identity: &Identity,
    socket: &mut WebSocket,
) -> Result<(mpsc::Receiver<ServerFrame>, u64), ()> {
    let decision = match state
        .lifecycle
        .evaluate_join_eligibility(stream_id, identity)
        .await
    {
        Ok(decision) => decision,
        Err(err) => {
            send_frame(socket, &error_frame(&err)).await;
            return Err(());
        },
    };

    let (ice_servers, mute_on_entry) = match decision {
        JoinDecision::Allowed {
            ice_servers,
            mute_on_entry,
            ..
        } => (ice_servers, mute_on_entry),
        JoinDecision::Denied { reason } => {
            send_frame(socket, &ServerFrame::JoinRejected { reason }).await;
            return Err(());
        },
        JoinDecision::Redirect { meeting_url, .. } => {
            // external sessions have no native room to join
            send_frame(
                socket,
                &ServerFrame::Error {
                    code: "EXTERNAL_SESSION".to_string(),
                    message: meeting_url,
                },
            )
            .await;
            return Err(());
        },
    };

    let cap = match state.lifecycle.participant_cap(stream_id).await {
        Ok(cap) => cap,
        Err(err) => {
            send_frame(socket, &error_frame(&err)).await;
            return Err(());
        },
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

    // Second capacity check, against live connections this time. A room
    // closing under collection rejects the registration; re-resolve it.
    let mut attempt = 0;
    let (room, generation) = loop {
        let room = state.registry.get_or_create(stream_id);
        match room
            .register(
                crate::room::NewConnection {
                    user_id: identity.user_id,
                    display_name: identity.display_name.clone(),
                    role: identity.role,
                    sender: outbound_tx.clone(),
                },
                Some(cap),
            )
            .await
        {
            Ok(generation) => break (room, generation),
            Err(AppError::InvalidState(_)) if attempt < 2 => {
                attempt += 1;
                tokio::task::yield_now().await;
            },
            Err(err) => {
                let frame = match &err {
                    AppError::Capacity { .. } => {
                        counter!(crate::metrics::JOIN_DENIED).increment(1);
                        ServerFrame::JoinRejected {
                            reason: DenyReason::Full,
                        }
                    },
                    other => error_frame(other),
                };
                send_frame(socket, &frame).await;
                state.registry.collect_if_empty(stream_id).await;
                return Err(());
            },
        }
    };

    if let Err(err) = state
        .lifecycle
        .record_join(stream_id, identity, None)
        .await
    {
        send_frame(socket, &error_frame(&err)).await;
        let _ = room.unregister_if(identity.user_id, generation).await;
        state.registry.collect_if_empty(stream_id).await;
        return Err(());
    }

    let host_id = room.find_host().await.ok().flatten();
    send_frame(
        socket,
        &ServerFrame::Joined {
            stream_id,
            user_id: identity.user_id,
            role: identity.role,
            ice_servers,
            host_id,
            mute_on_entry,
        },
    )
    .await;

    room.broadcast(ServerFrame::ParticipantJoined {
        user_id: identity.user_id,
        display_name: identity.display_name.clone(),
        role: identity.role,
    });

    Ok((outbound_rx, generation))
}

async fn handle_connection(
    mut socket: WebSocket,
    state: Arc<AppState>,
    stream_id: Uuid,
    identity: Identity,
) {
    gauge!(crate::metrics::WS_ACTIVE).increment(1.0);

    if let Ok((outbound_rx, generation)) = admit(&state, stream_id, &identity, &mut socket).await {
        run_connection(socket, &state, stream_id, &identity, outbound_rx, generation).await;
    }

    gauge!(crate::metrics::WS_ACTIVE).decrement(1.0);
}

async fn run_connection(
    socket: WebSocket,
    state: &AppState,
    stream_id: Uuid,
    identity: &Identity,
    mut outbound_rx: mpsc::Receiver<ServerFrame>,
    generation: u64,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let user_id = identity.user_id;

    // Pump room frames out to the socket. ForceDisconnect is terminal:
    // deliver it, then let the sink drop to close the transport.
    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let disconnect = matches!(frame, ServerFrame::ForceDisconnect { .. });
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                },
                Err(err) => {
                    tracing::error!(%err, "failed to serialize outbound frame");
                },
            }
            if disconnect {
                let _ = ws_tx.close().await;
                break;
            }
        }
    });

    let mut graceful = false;

    while let Some(Ok(message)) = ws_rx.next().await {
        // any inbound traffic counts as liveness
        if let Some(room) = state.registry.get(stream_id) {
            room.touch(user_id);
        }

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(err) => {
                let err = AppError::Json(err);
                reply(state, stream_id, user_id, error_frame(&err)).await;
                continue;
            },
        };

        match frame {
            ClientFrame::Signal { envelope } => {
                let was_leave = envelope.kind == SignalKind::Leave;
                match state.relay.handle(stream_id, identity, envelope).await {
                    Ok(outcome) => {
                        reply(state, stream_id, user_id, ServerFrame::SignalResult { outcome })
                            .await;
                    },
                    Err(err) => {
                        reply(state, stream_id, user_id, error_frame(&err)).await;
                    },
                }
                if was_leave {
                    graceful = true;
                    break;
                }
            },
            ClientFrame::Chat { body, kind } => {
                // success arrives via the room broadcast, errors directly
                if let Err(err) = state
                    .broadcaster
                    .send_chat(stream_id, identity, &body, kind)
                    .await
                {
                    reply(state, stream_id, user_id, error_frame(&err)).await;
                }
            },
            ClientFrame::Moderate { message_id, action } => {
                if let Err(err) = state
                    .broadcaster
                    .moderate(stream_id, identity, message_id, action)
                    .await
                {
                    reply(state, stream_id, user_id, error_frame(&err)).await;
                }
            },
            ClientFrame::Presence { event } => {
                state.broadcaster.broadcast_presence(stream_id, event);
            },
            ClientFrame::Heartbeat => {},
        }
    }

    // Reconcile a silent drop; a signaled leave already did its own
    // bookkeeping in the relay. The generation check keeps a superseded
    // socket's cleanup from evicting the registration and the attendance
    // record a rejoin just opened.
    if !graceful {
        let mut owned = true;
        if let Some(room) = state.registry.get(stream_id) {
            owned = room
                .unregister_if(user_id, generation)
                .await
                .unwrap_or(false);
            if owned {
                room.broadcast(ServerFrame::ParticipantLeft {
                    user_id,
                    reason: LeaveReason::ConnectionLost,
                });
            }
        }
        if owned {
            if let Err(err) = state
                .lifecycle
                .record_leave(stream_id, user_id, LeaveReason::ConnectionLost)
                .await
            {
                tracing::warn!(%stream_id, %user_id, %err, "disconnect bookkeeping failed");
            }
        }
    }
    state.registry.collect_if_empty(stream_id).await;

    send_task.abort();
}

/// Send a direct reply to this connection through its room entry. The
/// entry can be gone mid-call (removal, sweep); that is fine, the socket
/// is about to close anyway.
async fn reply(state: &AppState, stream_id: Uuid, user_id: Uuid, frame: ServerFrame) {
    if let Some(room) = state.registry.get(stream_id) {
        if let Err(err) = room.send_to(user_id, frame).await {
            tracing::debug!(%stream_id, %user_id, %err, "reply undeliverable");
        }
    }
}

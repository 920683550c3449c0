// ============================
// crates/backend-lib/src/handlers/sessions.rs
// ============================
//! Session REST endpoints: lifecycle transitions, join, signaling over
//! HTTP, chat and the dashboard snapshot. Everything here is a thin
//! authenticated shim over the controller, relay and broadcaster; the
//! WebSocket route carries the same operations for connected clients.

use super::authenticate;
use crate::error::AppError;
use crate::lifecycle::RoomSnapshot;
use crate::model::{LivestreamSession, RecordingRef, SessionStatus};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, patch, post},
    Json, Router,
};
use livecast_common::{
    ChatKind, ChatMessage, CreateSessionRequest, JoinDecision, ModerationAction, SettingsPatch,
    SignalEnvelope, SignalOutcome,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/start", post(start_session))
        .route("/api/sessions/{id}/end", post(end_session))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
        .route("/api/sessions/{id}/settings", patch(update_settings))
        .route("/api/sessions/{id}/join", post(join_session))
        .route("/api/sessions/{id}/signal", post(signal))
        .route("/api/sessions/{id}/chat", post(send_chat))
        .route("/api/sessions/{id}/chat/{message_id}", patch(moderate_chat))
        .route(
            "/api/sessions/{id}/participants/{user_id}",
            delete(remove_participant),
        )
        .route("/api/sessions/{id}/recordings", post(add_recording))
        .route("/api/sessions/{id}/snapshot", get(room_snapshot))
        .with_state(state)
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<LivestreamSession>), AppError> {
    let identity = authenticate(&state, &headers).await?;
    let session = state.lifecycle.create_session(&identity, req).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Deserialize)]
struct ListParams {
    host_id: Option<Uuid>,
    status: Option<SessionStatus>,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<LivestreamSession>>, AppError> {
    authenticate(&state, &headers).await?;
    let sessions = state
        .lifecycle
        .list_sessions(params.host_id, params.status)
        .await?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<LivestreamSession>, AppError> {
    authenticate(&state, &headers).await?;
    Ok(Json(state.lifecycle.get_session(id).await?))
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<LivestreamSession>, AppError> {
    let identity = authenticate(&state, &headers).await?;
    let session = state.lifecycle.start_session(id, identity.user_id).await?;
    Ok(Json(session))
}

async fn end_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<LivestreamSession>, AppError> {
    let identity = authenticate(&state, &headers).await?;
    let session = state.lifecycle.end_session(id, identity.user_id).await?;
    // connected clients get SessionEnded as their final frame
    state.broadcaster.announce_session_end(id).await;
    Ok(Json(session))
}

async fn cancel_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<LivestreamSession>, AppError> {
    let identity = authenticate(&state, &headers).await?;
    let session = state.lifecycle.cancel_session(id, identity.user_id).await?;
    Ok(Json(session))
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<LivestreamSession>, AppError> {
    let identity = authenticate(&state, &headers).await?;
    let session = state
        .lifecycle
        .update_settings(id, identity.user_id, &patch)
        .await?;
    Ok(Json(session))
}

/// Pre-flight join check. Admission is only final at WebSocket
/// registration; an `allowed` here can still race to a full room.
async fn join_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JoinDecision>, AppError> {
    let identity = authenticate(&state, &headers).await?;
    let decision = state
        .lifecycle
        .evaluate_join_eligibility(id, &identity)
        .await?;

    let decision = match decision {
        JoinDecision::Allowed {
            ice_servers,
            mute_on_entry,
            ..
        } => {
            let host_id = match state.registry.get(id) {
                Some(room) => room.find_host().await?,
                None => None,
            };
            JoinDecision::Allowed {
                ice_servers,
                host_id,
                mute_on_entry,
            }
        },
        other => other,
    };
    Ok(Json(decision))
}

/// Signaling over HTTP, a companion to the socket route for clients that
/// have not upgraded yet (ICE config via `host-ready`, pre-join checks).
/// Presence lives with the WebSocket transport: a host is only
/// registered with the room once its socket is admitted, so `join` over
/// this route reports `no_host` until then.
async fn signal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(envelope): Json<SignalEnvelope>,
) -> Result<Json<SignalOutcome>, AppError> {
    let identity = authenticate(&state, &headers).await?;
    let outcome = state.relay.handle(id, &identity, envelope).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct SendChatRequest {
    body: String,
    kind: ChatKind,
}

async fn send_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<SendChatRequest>,
) -> Result<(StatusCode, Json<ChatMessage>), AppError> {
    let identity = authenticate(&state, &headers).await?;
    let message = state
        .broadcaster
        .send_chat(id, &identity, &req.body, req.kind)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Deserialize)]
struct ModerateRequest {
    action: ModerationAction,
}

async fn moderate_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, message_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ModerateRequest>,
) -> Result<Json<ChatMessage>, AppError> {
    let identity = authenticate(&state, &headers).await?;
    let message = state
        .broadcaster
        .moderate(id, &identity, message_id, req.action)
        .await?;
    Ok(Json(message))
}

async fn remove_participant(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    let identity = authenticate(&state, &headers).await?;
    state
        .broadcaster
        .remove_participant(id, identity.user_id, user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_recording(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(recording): Json<RecordingRef>,
) -> Result<Json<LivestreamSession>, AppError> {
    let identity = authenticate(&state, &headers).await?;
    let session = state
        .lifecycle
        .add_recording(id, identity.user_id, recording)
        .await?;
    Ok(Json(session))
}

async fn room_snapshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<RoomSnapshot>, AppError> {
    authenticate(&state, &headers).await?;
    Ok(Json(state.lifecycle.room_snapshot(id).await?))
}

// ============================
// crates/backend-lib/src/broadcaster.rs
// ============================
//! Presence and chat fan-out.
//!
//! Chat goes through two stages: persist into the session document, then
//! enqueue the frame on the room actor. A per-stream order lock is held
//! across both stages so that the broadcast order always matches the
//! persisted chat log. The enqueue itself is non-blocking, so a slow
//! client never extends the critical section.
//!
//! Presence events skip the store entirely; they are ephemeral.

use crate::auth::Identity;
use crate::error::AppError;
use crate::lifecycle::LifecycleController;
use crate::registry::RoomRegistry;
use dashmap::DashMap;
use livecast_common::{
    ChatKind, ChatMessage, LeaveReason, ModerationAction, PresenceEvent, ServerFrame,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct Broadcaster {
    lifecycle: Arc<LifecycleController>,
    registry: Arc<RoomRegistry>,
    order_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Broadcaster {
    pub fn new(lifecycle: Arc<LifecycleController>, registry: Arc<RoomRegistry>) -> Self {
        Self {
            lifecycle,
            registry,
            order_locks: DashMap::new(),
        }
    }

    fn order_lock(&self, stream_id: Uuid) -> Arc<Mutex<()>> {
        self.order_locks
            .entry(stream_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Accept, persist and fan out one chat message. The sender receives
    /// its own message through the broadcast like everyone else, which
    /// keeps every client's view identically ordered.
    pub async fn send_chat(
        &self,
        stream_id: Uuid,
        sender: &Identity,
        body: &str,
        kind: ChatKind,
    ) -> Result<ChatMessage, AppError> {
        let lock = self.order_lock(stream_id);
        let _guard = lock.lock().await;

        let message = self
            .lifecycle
            .append_chat(stream_id, sender, body, kind)
            .await?;

        if let Some(room) = self.registry.get(stream_id) {
            room.broadcast(ServerFrame::Chat {
                message: message.clone(),
            });
        }
        Ok(message)
    }

    /// Apply a moderation action and re-broadcast the updated message.
    pub async fn moderate(
        &self,
        stream_id: Uuid,
        actor: &Identity,
        message_id: Uuid,
        action: ModerationAction,
    ) -> Result<ChatMessage, AppError> {
        let lock = self.order_lock(stream_id);
        let _guard = lock.lock().await;

        let message = self
            .lifecycle
            .moderate_chat(stream_id, actor, message_id, action)
            .await?;

        if let Some(room) = self.registry.get(stream_id) {
            room.broadcast(ServerFrame::ChatUpdated {
                message: message.clone(),
            });
        }
        Ok(message)
    }

    /// Fan out an ephemeral presence event. Never persisted, never fails
    /// the caller.
    pub fn broadcast_presence(&self, stream_id: Uuid, event: PresenceEvent) {
        if let Some(room) = self.registry.get(stream_id) {
            room.broadcast(ServerFrame::Presence { event });
        }
    }

    /// Host-initiated removal: close the attendance record, force the
    /// target's transport shut, and tell the room.
    pub async fn remove_participant(
        &self,
        stream_id: Uuid,
        host_id: Uuid,
        target_user_id: Uuid,
    ) -> Result<(), AppError> {
        self.lifecycle
            .remove_participant(stream_id, host_id, target_user_id)
            .await?;

        if let Some(room) = self.registry.get(stream_id) {
            if let Err(err) = room
                .send_to(
                    target_user_id,
                    ServerFrame::ForceDisconnect {
                        reason: LeaveReason::RemovedByHost,
                    },
                )
                .await
            {
                // already disconnected; the record is closed either way
                tracing::debug!(%stream_id, %target_user_id, %err, "removal notice undeliverable");
            }
            room.unregister(target_user_id).await?;
            room.broadcast(ServerFrame::ParticipantLeft {
                user_id: target_user_id,
                reason: LeaveReason::RemovedByHost,
            });
        }
        Ok(())
    }

    /// Announce the end of the session and drop the room. Connections
    /// receive `SessionEnded` as their final frame.
    pub async fn announce_session_end(&self, stream_id: Uuid) {
        if let Some(room) = self.registry.get(stream_id) {
            room.broadcast(ServerFrame::SessionEnded { stream_id });
            room.broadcast(ServerFrame::ForceDisconnect {
                reason: LeaveReason::ConnectionLost,
            });
        }
        self.registry.remove(stream_id);
        self.order_locks.remove(&stream_id);
    }
}

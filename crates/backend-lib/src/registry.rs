// ============================
// crates/backend-lib/src/registry.rs
// ============================
//! Stream id to room actor mapping.
//!
//! Rooms are created lazily on first lookup and garbage collected once
//! their last connection is gone. A room is addressed by the stream's id;
//! every caller on this instance resolves to the same actor, which is what
//! makes the actor the serialization point for the room.

use crate::room::{spawn_room, RoomHandle};
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<Uuid, RoomHandle>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The room for `stream_id`, spawning its actor if absent.
    pub fn get_or_create(&self, stream_id: Uuid) -> RoomHandle {
        self.rooms
            .entry(stream_id)
            .or_insert_with(|| spawn_room(stream_id))
            .clone()
    }

    /// The room for `stream_id`, if one is live.
    pub fn get(&self, stream_id: Uuid) -> Option<RoomHandle> {
        self.rooms.get(&stream_id).map(|entry| entry.clone())
    }

    /// Drop the room unconditionally. The actor stops once every
    /// outstanding handle is gone, which also frees any cached offer.
    pub fn remove(&self, stream_id: Uuid) {
        self.rooms.remove(&stream_id);
    }

    /// Drop the room if it has no connections left. Returns `true` when
    /// the room was collected. The actor decides atomically: closing and
    /// the emptiness check happen in one command, so a registration cannot
    /// slip in between the check and the removal — it either lands before
    /// the close (room stays) or fails against the closed actor and the
    /// caller re-resolves to a fresh room.
    pub async fn collect_if_empty(&self, stream_id: Uuid) -> bool {
        let Some(handle) = self.get(stream_id) else {
            return false;
        };
        match handle.close_if_empty().await {
            Ok(true) => {
                // only drop the mapping if it still points at the actor we
                // closed; a fresh room may already have replaced it
                self.rooms
                    .remove_if(&stream_id, |_, current| current.same_actor(&handle));
                tracing::debug!(%stream_id, "collected empty room");
                true
            },
            _ => false,
        }
    }

    /// Ids of every live room, for the reaper's sweep.
    pub fn live_rooms(&self) -> Vec<Uuid> {
        self.rooms.iter().map(|entry| *entry.key()).collect()
    }
}

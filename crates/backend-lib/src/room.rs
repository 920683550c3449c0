// ============================
// crates/backend-lib/src/room.rs
// ============================
//! Per-room actor.
//!
//! One actor task owns all mutable state for a room: the connection set,
//! the host's cached offer, and per-connection liveness timestamps. Every
//! registry mutation and broadcast for a stream goes through this task's
//! command channel, which makes the capacity check and the chat ordering
//! guarantee single-writer properties instead of lock discipline.
//!
//! Delivery uses each connection's bounded outbound channel with
//! `try_send`: enqueueing never blocks the actor, closed transports are
//! pruned, and a full channel loses the frame (at-most-once delivery).

use crate::error::AppError;
use chrono::{DateTime, Utc};
use livecast_common::{LeaveReason, ParticipantRole, ServerFrame};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Outbound channel towards one connected transport.
pub type OutboundSender = mpsc::Sender<ServerFrame>;

/// Registration payload for a new transport.
pub struct NewConnection {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: ParticipantRole,
    pub sender: OutboundSender,
}

/// Connection state owned by the actor.
struct RoomConnection {
    user_id: Uuid,
    generation: u64,
    display_name: String,
    role: ParticipantRole,
    sender: OutboundSender,
    connected_at: DateTime<Utc>,
    last_seen: Instant,
}

/// Snapshot of one connection, safe to hand outside the actor.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionInfo {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: ParticipantRole,
    pub connected_at: DateTime<Utc>,
}

/// Message sent *into* the actor
enum RoomCommand {
    Register {
        conn: NewConnection,
        max_participants: Option<u32>,
        resp: oneshot::Sender<Result<u64, AppError>>,
    },
    Unregister {
        user_id: Uuid,
        generation: Option<u64>,
        resp: oneshot::Sender<bool>,
    },
    CloseIfEmpty {
        resp: oneshot::Sender<bool>,
    },
    Snapshot {
        resp: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Broadcast {
        frame: ServerFrame,
    },
    SendTo {
        user_id: Uuid,
        frame: ServerFrame,
        resp: oneshot::Sender<Result<(), AppError>>,
    },
    FindHost {
        resp: oneshot::Sender<Option<Uuid>>,
    },
    CacheOffer {
        payload: Value,
    },
    CachedOffer {
        resp: oneshot::Sender<Option<Value>>,
    },
    Touch {
        user_id: Uuid,
    },
    SweepIdle {
        threshold: Duration,
        resp: oneshot::Sender<Vec<Uuid>>,
    },
    IsEmpty {
        resp: oneshot::Sender<bool>,
    },
}

/// Handle that other components keep: the actor's command channel.
#[derive(Clone)]
pub struct RoomHandle {
    pub stream_id: Uuid,
    cmd_tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    /// Register a transport. This is the serialization point for the
    /// capacity check: the count of live participant connections, not the
    /// persisted roster, decides admission. An existing connection for the
    /// same user is superseded (last-writer-wins). Returns a generation
    /// token identifying this registration; a superseded socket's token no
    /// longer matches, so its cleanup cannot evict the successor.
    pub async fn register(
        &self,
        conn: NewConnection,
        max_participants: Option<u32>,
    ) -> Result<u64, AppError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx.send(RoomCommand::Register {
            conn,
            max_participants,
            resp,
        })?;
        rx.await?
    }

    /// Remove a transport; returns `false` if it was not registered.
    pub async fn unregister(&self, user_id: Uuid) -> Result<bool, AppError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx.send(RoomCommand::Unregister {
            user_id,
            generation: None,
            resp,
        })?;
        Ok(rx.await?)
    }

    /// Remove a transport only if `generation` still identifies the live
    /// registration for this user. Returns `false` when the registration
    /// has been superseded or is already gone.
    pub async fn unregister_if(&self, user_id: Uuid, generation: u64) -> Result<bool, AppError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx.send(RoomCommand::Unregister {
            user_id,
            generation: Some(generation),
            resp,
        })?;
        Ok(rx.await?)
    }

    /// Close the room for new registrations if it has no connections.
    /// Returns `true` when the room closed; from then on `register` fails
    /// with `InvalidState` and the caller must look the room up again.
    pub async fn close_if_empty(&self) -> Result<bool, AppError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx.send(RoomCommand::CloseIfEmpty { resp })?;
        Ok(rx.await?)
    }

    /// Whether both handles point at the same actor task.
    pub fn same_actor(&self, other: &RoomHandle) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }

    /// Snapshot of the room. Entries may disappear between the snapshot
    /// and any delivery attempt; callers must tolerate that.
    pub async fn snapshot(&self) -> Result<Vec<ConnectionInfo>, AppError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx.send(RoomCommand::Snapshot { resp })?;
        Ok(rx.await?)
    }

    /// Queue a frame for every connection, in actor order.
    pub fn broadcast(&self, frame: ServerFrame) {
        let _ = self.cmd_tx.send(RoomCommand::Broadcast { frame });
    }

    /// Queue a frame for one connection; `NotFound` if it is not
    /// registered.
    pub async fn send_to(&self, user_id: Uuid, frame: ServerFrame) -> Result<(), AppError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx.send(RoomCommand::SendTo {
            user_id,
            frame,
            resp,
        })?;
        rx.await?
    }

    /// The currently registered host connection, if any.
    pub async fn find_host(&self) -> Result<Option<Uuid>, AppError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx.send(RoomCommand::FindHost { resp })?;
        Ok(rx.await?)
    }

    /// Cache the host's offer so late joiners can fetch it.
    pub fn cache_offer(&self, payload: Value) {
        let _ = self.cmd_tx.send(RoomCommand::CacheOffer { payload });
    }

    pub async fn cached_offer(&self) -> Result<Option<Value>, AppError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx.send(RoomCommand::CachedOffer { resp })?;
        Ok(rx.await?)
    }

    /// Refresh a connection's liveness timestamp.
    pub fn touch(&self, user_id: Uuid) {
        let _ = self.cmd_tx.send(RoomCommand::Touch { user_id });
    }

    /// Drop connections idle past `threshold`; returns the affected users.
    pub async fn sweep_idle(&self, threshold: Duration) -> Result<Vec<Uuid>, AppError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(RoomCommand::SweepIdle { threshold, resp })?;
        Ok(rx.await?)
    }

    pub async fn is_empty(&self) -> Result<bool, AppError> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx.send(RoomCommand::IsEmpty { resp })?;
        Ok(rx.await?)
    }
}

struct RoomActor {
    stream_id: Uuid,
    connections: Vec<RoomConnection>,
    cached_offer: Option<Value>,
    next_generation: u64,
    closed: bool,
}

impl RoomActor {
    fn new(stream_id: Uuid) -> Self {
        RoomActor {
            stream_id,
            connections: Vec::new(),
            cached_offer: None,
            next_generation: 0,
            closed: false,
        }
    }

    fn handle_register(
        &mut self,
        conn: NewConnection,
        max_participants: Option<u32>,
    ) -> Result<u64, AppError> {
        if self.closed {
            return Err(AppError::InvalidState(format!(
                "room {} is closed",
                self.stream_id
            )));
        }

        // Last-writer-wins: supersede an existing connection for this user
        // before counting against capacity.
        if let Some(pos) = self
            .connections
            .iter()
            .position(|c| c.user_id == conn.user_id)
        {
            let old = self.connections.remove(pos);
            let _ = old.sender.try_send(ServerFrame::ForceDisconnect {
                reason: LeaveReason::ConnectionLost,
            });
            tracing::debug!(
                stream_id = %self.stream_id,
                user_id = %conn.user_id,
                "superseded existing connection"
            );
        }

        if conn.role == ParticipantRole::Participant {
            if let Some(limit) = max_participants {
                let participants = self
                    .connections
                    .iter()
                    .filter(|c| c.role == ParticipantRole::Participant)
                    .count() as u32;
                if participants >= limit {
                    return Err(AppError::Capacity { limit });
                }
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.connections.push(RoomConnection {
            user_id: conn.user_id,
            generation,
            display_name: conn.display_name,
            role: conn.role,
            sender: conn.sender,
            connected_at: Utc::now(),
            last_seen: Instant::now(),
        });

        Ok(generation)
    }

    fn handle_broadcast(&mut self, frame: &ServerFrame) {
        // try_send keeps the actor from blocking on a slow client. A full
        // channel loses the frame for that client only; a closed channel
        // means the transport is gone and gets pruned.
        self.connections.retain(|conn| {
            match conn.sender.try_send(frame.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::counter!(crate::metrics::SIGNALS_DROPPED).increment(1);
                    tracing::debug!(
                        stream_id = %self.stream_id,
                        user_id = %conn.user_id,
                        "dropped frame for slow client"
                    );
                    true
                },
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn handle_send_to(&mut self, user_id: Uuid, frame: ServerFrame) -> Result<(), AppError> {
        let Some(pos) = self.connections.iter().position(|c| c.user_id == user_id) else {
            return Err(AppError::NotFound(format!(
                "no connection for user {user_id}"
            )));
        };

        match self.connections[pos].sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!(crate::metrics::SIGNALS_DROPPED).increment(1);
                Ok(())
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.connections.remove(pos);
                Err(AppError::NotFound(format!(
                    "connection for user {user_id} is gone"
                )))
            },
        }
    }

    fn handle_sweep(&mut self, threshold: Duration) -> Vec<Uuid> {
        let mut swept = Vec::new();
        self.connections.retain(|conn| {
            if conn.last_seen.elapsed() > threshold {
                swept.push(conn.user_id);
                false
            } else {
                true
            }
        });
        if !swept.is_empty() {
            metrics::counter!(crate::metrics::CONNECTIONS_REAPED).increment(swept.len() as u64);
        }
        swept
    }

    fn run_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Register {
                conn,
                max_participants,
                resp,
            } => {
                let _ = resp.send(self.handle_register(conn, max_participants));
            },
            RoomCommand::Unregister {
                user_id,
                generation,
                resp,
            } => {
                let before = self.connections.len();
                self.connections.retain(|c| {
                    c.user_id != user_id || generation.is_some_and(|g| c.generation != g)
                });
                let _ = resp.send(self.connections.len() != before);
            },
            RoomCommand::CloseIfEmpty { resp } => {
                if self.connections.is_empty() {
                    self.closed = true;
                }
                let _ = resp.send(self.closed && self.connections.is_empty());
            },
            RoomCommand::Snapshot { resp } => {
                let infos = self
                    .connections
                    .iter()
                    .map(|c| ConnectionInfo {
                        user_id: c.user_id,
                        display_name: c.display_name.clone(),
                        role: c.role,
                        connected_at: c.connected_at,
                    })
                    .collect();
                let _ = resp.send(infos);
            },
            RoomCommand::Broadcast { frame } => self.handle_broadcast(&frame),
            RoomCommand::SendTo {
                user_id,
                frame,
                resp,
            } => {
                let _ = resp.send(self.handle_send_to(user_id, frame));
            },
            RoomCommand::FindHost { resp } => {
                let host = self
                    .connections
                    .iter()
                    .find(|c| c.role == ParticipantRole::Host)
                    .map(|c| c.user_id);
                let _ = resp.send(host);
            },
            RoomCommand::CacheOffer { payload } => {
                self.cached_offer = Some(payload);
            },
            RoomCommand::CachedOffer { resp } => {
                let _ = resp.send(self.cached_offer.clone());
            },
            RoomCommand::Touch { user_id } => {
                if let Some(conn) = self.connections.iter_mut().find(|c| c.user_id == user_id) {
                    conn.last_seen = Instant::now();
                }
            },
            RoomCommand::SweepIdle { threshold, resp } => {
                let _ = resp.send(self.handle_sweep(threshold));
            },
            RoomCommand::IsEmpty { resp } => {
                let _ = resp.send(self.connections.is_empty());
            },
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        while let Some(cmd) = rx.recv().await {
            self.run_command(cmd);
        }
        tracing::debug!(stream_id = %self.stream_id, "room actor stopped");
    }
}

/// Spawn a new room actor and return its handle. The actor ends (and the
/// cached offer is freed) when the last handle is dropped.
pub fn spawn_room(stream_id: Uuid) -> RoomHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let actor = RoomActor::new(stream_id);

    tokio::spawn(async move {
        actor.run(cmd_rx).await;
    });

    RoomHandle { stream_id, cmd_tx }
}

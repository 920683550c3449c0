// ============================
// crates/backend-lib/src/reaper.rs
// ============================
//! Connection reaper.
//!
//! Transport close events are not always delivered, so a periodic sweep
//! treats any connection with no activity past the liveness threshold as
//! gone: its attendance record is closed with `connection_lost`, the room
//! is notified, and empty rooms are collected. Failures here are logged
//! and skipped; a bad room must not stall the sweep of the others.

use crate::lifecycle::LifecycleController;
use crate::registry::RoomRegistry;
use livecast_common::{LeaveReason, ServerFrame};
use std::sync::Arc;
use std::time::Duration;

pub struct Reaper {
    lifecycle: Arc<LifecycleController>,
    registry: Arc<RoomRegistry>,
    sweep_interval: Duration,
    liveness_timeout: Duration,
}

impl Reaper {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        registry: Arc<RoomRegistry>,
        sweep_interval: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            sweep_interval,
            liveness_timeout,
        }
    }

    /// Run the sweep loop until the process exits.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// One reconciliation pass over every live room, plus housekeeping
    /// for the lifecycle controller's rate-limit windows.
    pub async fn sweep_once(&self) {
        self.lifecycle.cleanup_rate_limits();

        for stream_id in self.registry.live_rooms() {
            let Some(room) = self.registry.get(stream_id) else {
                continue;
            };

            let swept = match room.sweep_idle(self.liveness_timeout).await {
                Ok(swept) => swept,
                Err(err) => {
                    tracing::warn!(%stream_id, %err, "idle sweep failed");
                    continue;
                },
            };

            for user_id in swept {
                tracing::info!(%stream_id, %user_id, "reaping idle connection");
                room.broadcast(ServerFrame::ParticipantLeft {
                    user_id,
                    reason: LeaveReason::ConnectionLost,
                });
                if let Err(err) = self
                    .lifecycle
                    .record_leave(stream_id, user_id, LeaveReason::ConnectionLost)
                    .await
                {
                    tracing::warn!(%stream_id, %user_id, %err, "leave bookkeeping failed");
                }
            }

            self.registry.collect_if_empty(stream_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::config::{IceSettings, RateLimitSettings};
    use crate::enrollment::MemoryEnrollments;
    use crate::room::NewConnection;
    use crate::store::FlatFileStore;
    use livecast_common::{CreateSessionRequest, ParticipantRole};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_sweep_reconciles_dead_connections() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FlatFileStore::new(tmp.path()).unwrap());
        let lifecycle = Arc::new(LifecycleController::new(
            store,
            Arc::new(MemoryEnrollments::new()),
            &RateLimitSettings {
                window_ms: 60_000,
                max_requests: 100,
            },
            &IceSettings::default(),
            100,
            Duration::from_secs(5),
        ));
        let registry = Arc::new(RoomRegistry::new());

        let host = Identity {
            user_id: Uuid::new_v4(),
            display_name: "Ada".to_string(),
            role: ParticipantRole::Host,
        };
        let session = lifecycle
            .create_session(
                &host,
                CreateSessionRequest {
                    title: "reap".to_string(),
                    course_id: None,
                    scheduled_for: None,
                    is_public: true,
                    settings: None,
                },
            )
            .await
            .unwrap();
        lifecycle
            .start_session(session.id, host.user_id)
            .await
            .unwrap();

        let viewer = Identity {
            user_id: Uuid::new_v4(),
            display_name: "Bob".to_string(),
            role: ParticipantRole::Participant,
        };
        lifecycle.record_join(session.id, &viewer, None).await.unwrap();

        let (tx, _rx) = mpsc::channel(4);
        registry
            .get_or_create(session.id)
            .register(
                NewConnection {
                    user_id: viewer.user_id,
                    display_name: viewer.display_name.clone(),
                    role: viewer.role,
                    sender: tx,
                },
                None,
            )
            .await
            .unwrap();

        let reaper = Reaper::new(
            lifecycle.clone(),
            registry.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );

        // connection goes idle past the threshold
        tokio::time::sleep(Duration::from_millis(30)).await;
        reaper.sweep_once().await;

        let loaded = lifecycle.get_session(session.id).await.unwrap();
        let record = loaded
            .participants
            .iter()
            .find(|p| p.user_id == viewer.user_id)
            .unwrap();
        assert_eq!(record.left_reason, Some(LeaveReason::ConnectionLost));

        // the emptied room was collected
        assert!(registry.get(session.id).is_none());
    }

    #[tokio::test]
    async fn test_sweep_drops_stale_rate_limit_windows() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FlatFileStore::new(tmp.path()).unwrap());
        let lifecycle = Arc::new(LifecycleController::new(
            store,
            Arc::new(MemoryEnrollments::new()),
            &RateLimitSettings {
                window_ms: 5,
                max_requests: 100,
            },
            &IceSettings::default(),
            100,
            Duration::from_secs(5),
        ));
        let registry = Arc::new(RoomRegistry::new());

        let host = Identity {
            user_id: Uuid::new_v4(),
            display_name: "Ada".to_string(),
            role: ParticipantRole::Host,
        };
        lifecycle
            .create_session(
                &host,
                CreateSessionRequest {
                    title: "windows".to_string(),
                    course_id: None,
                    scheduled_for: None,
                    is_public: true,
                    settings: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(lifecycle.rate_limit_tracked_keys(), 1);

        let reaper = Reaper::new(
            lifecycle.clone(),
            registry,
            Duration::from_millis(10),
            Duration::from_millis(10),
        );

        // let the window go stale, then sweep
        tokio::time::sleep(Duration::from_millis(25)).await;
        reaper.sweep_once().await;
        assert_eq!(lifecycle.rate_limit_tracked_keys(), 0);
    }
}

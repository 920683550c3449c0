// ============================
// crates/backend-lib/src/signaling.rs
// ============================
//! WebRTC signaling relay.
//!
//! Routes offer/answer/candidate traffic between the one host and N
//! participants of a room. The topology is a star: every handshake leg
//! has the host on one end, so routing needs only "the registered host"
//! and "the addressed user", never a mesh.
//!
//! Delivery is at-most-once and best-effort. A lost candidate is fine;
//! ICE restart and renegotiation are the recovery path, not this relay.

use crate::auth::Identity;
use crate::error::AppError;
use crate::lifecycle::LifecycleController;
use crate::registry::RoomRegistry;
use livecast_common::{
    DenyReason, LeaveReason, ParticipantRole, ServerFrame, SignalEnvelope, SignalKind,
    SignalOutcome,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct SignalingRelay {
    lifecycle: Arc<LifecycleController>,
    registry: Arc<RoomRegistry>,
    op_timeout: Duration,
}

impl SignalingRelay {
    pub fn new(
        lifecycle: Arc<LifecycleController>,
        registry: Arc<RoomRegistry>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            op_timeout,
        }
    }

    /// Handle one signaling message from `sender`, bounded by the
    /// operation timeout so a wedged room cannot hang the caller.
    pub async fn handle(
        &self,
        stream_id: Uuid,
        sender: &Identity,
        envelope: SignalEnvelope,
    ) -> Result<SignalOutcome, AppError> {
        if envelope.from_user_id != sender.user_id {
            return Err(AppError::Forbidden(
                "signal sender does not match the connection identity".to_string(),
            ));
        }

        tokio::time::timeout(self.op_timeout, self.dispatch(stream_id, sender, envelope))
            .await
            .map_err(|_| AppError::Timeout("signaling relay".to_string()))?
    }

    async fn dispatch(
        &self,
        stream_id: Uuid,
        sender: &Identity,
        envelope: SignalEnvelope,
    ) -> Result<SignalOutcome, AppError> {
        match envelope.kind {
            SignalKind::HostReady => self.handle_host_ready(sender),
            SignalKind::Join => self.handle_join(stream_id).await,
            SignalKind::Offer => self.handle_offer(stream_id, sender, envelope).await,
            SignalKind::Answer => self.handle_answer(stream_id, envelope).await,
            SignalKind::Candidate => self.handle_candidate(stream_id, envelope).await,
            SignalKind::Leave => self.handle_leave(stream_id, sender).await,
        }
    }

    /// The host announces readiness and receives its ICE configuration.
    /// Presence is owned by the transport, not this signal: the host is
    /// registered with the room when its socket is admitted, so a
    /// `host-ready` sent over the HTTP relay (before any socket exists)
    /// configures ICE but does not make `join` resolvable yet.
    fn handle_host_ready(&self, sender: &Identity) -> Result<SignalOutcome, AppError> {
        if sender.role != ParticipantRole::Host {
            return Err(AppError::Forbidden(
                "only the host may announce readiness".to_string(),
            ));
        }
        Ok(SignalOutcome::IceConfig {
            ice_servers: self.lifecycle.ice_servers(),
        })
    }

    /// A participant asks for its handshake counterpart. The host must be
    /// registered; the cached offer is included if the host published one
    /// before this peer arrived.
    async fn handle_join(&self, stream_id: Uuid) -> Result<SignalOutcome, AppError> {
        let Some(room) = self.registry.get(stream_id) else {
            return Ok(SignalOutcome::Rejected {
                reason: DenyReason::NoHost,
            });
        };
        let Some(host_id) = room.find_host().await? else {
            return Ok(SignalOutcome::Rejected {
                reason: DenyReason::NoHost,
            });
        };

        Ok(SignalOutcome::JoinAccepted {
            ice_servers: self.lifecycle.ice_servers(),
            host_id,
            pending_offer: room.cached_offer().await?,
        })
    }

    /// The host publishes its offer. It is always cached for late joiners
    /// and additionally forwarded when addressed to a specific peer.
    async fn handle_offer(
        &self,
        stream_id: Uuid,
        sender: &Identity,
        envelope: SignalEnvelope,
    ) -> Result<SignalOutcome, AppError> {
        if sender.role != ParticipantRole::Host {
            return Err(AppError::Forbidden(
                "only the host may send offers".to_string(),
            ));
        }
        let Some(room) = self.registry.get(stream_id) else {
            return Err(AppError::NotFound(format!("room {stream_id}")));
        };

        room.cache_offer(envelope.payload.clone());

        if let Some(target) = envelope.to_user_id {
            match room.send_to(target, ServerFrame::Signal { envelope }).await {
                Ok(()) => {
                    metrics::counter!(crate::metrics::SIGNALS_RELAYED).increment(1);
                },
                Err(AppError::NotFound(_)) => {
                    // target left between addressing and delivery
                    tracing::debug!(%stream_id, %target, "offer target is gone");
                },
                Err(err) => return Err(err),
            }
        }
        Ok(SignalOutcome::Ack)
    }

    /// Participant answer, routed to the host connection. Unlike candidate
    /// loss, a missing host is surfaced: the handshake cannot proceed and
    /// the participant should re-join.
    async fn handle_answer(
        &self,
        stream_id: Uuid,
        envelope: SignalEnvelope,
    ) -> Result<SignalOutcome, AppError> {
        let Some(room) = self.registry.get(stream_id) else {
            return Err(AppError::NotFound(format!("room {stream_id}")));
        };

        let target = match envelope.to_user_id {
            Some(target) => target,
            None => room
                .find_host()
                .await?
                .ok_or_else(|| AppError::NotFound("host connection is gone".to_string()))?,
        };

        room.send_to(target, ServerFrame::Signal { envelope })
            .await
            .map_err(|_| AppError::NotFound("host connection is gone".to_string()))?;
        metrics::counter!(crate::metrics::SIGNALS_RELAYED).increment(1);
        Ok(SignalOutcome::Ack)
    }

    /// ICE candidates flow in both directions and are droppable.
    async fn handle_candidate(
        &self,
        stream_id: Uuid,
        envelope: SignalEnvelope,
    ) -> Result<SignalOutcome, AppError> {
        let Some(room) = self.registry.get(stream_id) else {
            return Ok(SignalOutcome::Ack);
        };

        let target = match envelope.to_user_id {
            Some(target) => Some(target),
            None => room.find_host().await?,
        };

        if let Some(target) = target {
            match room.send_to(target, ServerFrame::Signal { envelope }).await {
                Ok(()) => {
                    metrics::counter!(crate::metrics::SIGNALS_RELAYED).increment(1);
                },
                Err(AppError::NotFound(_)) => {
                    metrics::counter!(crate::metrics::SIGNALS_DROPPED).increment(1);
                    tracing::debug!(%stream_id, %target, "candidate target is gone");
                },
                Err(err) => return Err(err),
            }
        }
        Ok(SignalOutcome::Ack)
    }

    /// Intentional departure: unregister the transport, close the
    /// attendance record and tell the room.
    async fn handle_leave(
        &self,
        stream_id: Uuid,
        sender: &Identity,
    ) -> Result<SignalOutcome, AppError> {
        if let Some(room) = self.registry.get(stream_id) {
            room.unregister(sender.user_id).await?;
            room.broadcast(ServerFrame::ParticipantLeft {
                user_id: sender.user_id,
                reason: LeaveReason::SelfLeft,
            });
        }

        if let Err(err) = self
            .lifecycle
            .record_leave(stream_id, sender.user_id, LeaveReason::SelfLeft)
            .await
        {
            // cleanup must not fail the room; the reaper reconciles later
            tracing::warn!(%stream_id, user_id = %sender.user_id, %err, "leave bookkeeping failed");
        }

        self.registry.collect_if_empty(stream_id).await;
        Ok(SignalOutcome::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IceSettings, RateLimitSettings};
    use crate::enrollment::MemoryEnrollments;
    use crate::room::NewConnection;
    use crate::store::FlatFileStore;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        relay: SignalingRelay,
        registry: Arc<RoomRegistry>,
        _tmp: TempDir,
    }

    fn fixture() -> Fixture {
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
        Fixture {
            relay: SignalingRelay::new(lifecycle, registry.clone(), Duration::from_secs(5)),
            registry,
            _tmp: tmp,
        }
    }

    fn identity(role: ParticipantRole) -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            display_name: "peer".to_string(),
            role,
        }
    }

    async fn register(
        fx: &Fixture,
        stream_id: Uuid,
        identity: &Identity,
    ) -> mpsc::Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(16);
        fx.registry
            .get_or_create(stream_id)
            .register(
                NewConnection {
                    user_id: identity.user_id,
                    display_name: identity.display_name.clone(),
                    role: identity.role,
                    sender: tx,
                },
                None,
            )
            .await
            .unwrap();
        rx
    }

    fn envelope(kind: SignalKind, from: Uuid, to: Option<Uuid>) -> SignalEnvelope {
        SignalEnvelope {
            kind,
            from_user_id: from,
            to_user_id: to,
            payload: serde_json::json!({"sdp": "v=0"}),
        }
    }

    #[tokio::test]
    async fn test_host_ready_requires_host_role() {
        let fx = fixture();
        let stream_id = Uuid::new_v4();
        let viewer = identity(ParticipantRole::Participant);

        let err = fx
            .relay
            .handle(
                stream_id,
                &viewer,
                envelope(SignalKind::HostReady, viewer.user_id, None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let host = identity(ParticipantRole::Host);
        let outcome = fx
            .relay
            .handle(
                stream_id,
                &host,
                envelope(SignalKind::HostReady, host.user_id, None),
            )
            .await
            .unwrap();
        match outcome {
            SignalOutcome::IceConfig { ice_servers } => assert!(!ice_servers.is_empty()),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_host_ready_does_not_register_presence() {
        let fx = fixture();
        let stream_id = Uuid::new_v4();
        let host = identity(ParticipantRole::Host);

        // readiness without a socket configures ICE only
        fx.relay
            .handle(
                stream_id,
                &host,
                envelope(SignalKind::HostReady, host.user_id, None),
            )
            .await
            .unwrap();
        assert!(fx.registry.get(stream_id).is_none());

        // joins resolve once the host's transport registers
        let viewer = identity(ParticipantRole::Participant);
        let outcome = fx
            .relay
            .handle(
                stream_id,
                &viewer,
                envelope(SignalKind::Join, viewer.user_id, None),
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SignalOutcome::Rejected {
                reason: DenyReason::NoHost
            }
        ));

        let _host_rx = register(&fx, stream_id, &host).await;
        let outcome = fx
            .relay
            .handle(
                stream_id,
                &viewer,
                envelope(SignalKind::Join, viewer.user_id, None),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, SignalOutcome::JoinAccepted { .. }));
    }

    #[tokio::test]
    async fn test_spoofed_sender_is_rejected() {
        let fx = fixture();
        let viewer = identity(ParticipantRole::Participant);
        let err = fx
            .relay
            .handle(
                Uuid::new_v4(),
                &viewer,
                envelope(SignalKind::Candidate, Uuid::new_v4(), None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_join_without_host_is_rejected() {
        let fx = fixture();
        let viewer = identity(ParticipantRole::Participant);
        let outcome = fx
            .relay
            .handle(
                Uuid::new_v4(),
                &viewer,
                envelope(SignalKind::Join, viewer.user_id, None),
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SignalOutcome::Rejected {
                reason: DenyReason::NoHost
            }
        ));
    }

    #[tokio::test]
    async fn test_late_joiner_gets_cached_offer() {
        let fx = fixture();
        let stream_id = Uuid::new_v4();
        let host = identity(ParticipantRole::Host);
        let _host_rx = register(&fx, stream_id, &host).await;

        fx.relay
            .handle(
                stream_id,
                &host,
                envelope(SignalKind::Offer, host.user_id, None),
            )
            .await
            .unwrap();

        let viewer = identity(ParticipantRole::Participant);
        let _viewer_rx = register(&fx, stream_id, &viewer).await;
        let outcome = fx
            .relay
            .handle(
                stream_id,
                &viewer,
                envelope(SignalKind::Join, viewer.user_id, None),
            )
            .await
            .unwrap();

        match outcome {
            SignalOutcome::JoinAccepted {
                host_id,
                pending_offer,
                ..
            } => {
                assert_eq!(host_id, host.user_id);
                // the payload arrives unmodified
                assert_eq!(pending_offer.unwrap()["sdp"], "v=0");
            },
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offer_requires_host_role() {
        let fx = fixture();
        let stream_id = Uuid::new_v4();
        let viewer = identity(ParticipantRole::Participant);
        let _rx = register(&fx, stream_id, &viewer).await;

        let err = fx
            .relay
            .handle(
                stream_id,
                &viewer,
                envelope(SignalKind::Offer, viewer.user_id, None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_addressed_offer_is_forwarded() {
        let fx = fixture();
        let stream_id = Uuid::new_v4();
        let host = identity(ParticipantRole::Host);
        let viewer = identity(ParticipantRole::Participant);
        let _host_rx = register(&fx, stream_id, &host).await;
        let mut viewer_rx = register(&fx, stream_id, &viewer).await;

        fx.relay
            .handle(
                stream_id,
                &host,
                envelope(SignalKind::Offer, host.user_id, Some(viewer.user_id)),
            )
            .await
            .unwrap();

        match viewer_rx.recv().await.unwrap() {
            ServerFrame::Signal { envelope } => {
                assert_eq!(envelope.kind, SignalKind::Offer);
                assert_eq!(envelope.from_user_id, host.user_id);
            },
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_answer_routes_to_host() {
        let fx = fixture();
        let stream_id = Uuid::new_v4();
        let host = identity(ParticipantRole::Host);
        let viewer = identity(ParticipantRole::Participant);
        let mut host_rx = register(&fx, stream_id, &host).await;
        let _viewer_rx = register(&fx, stream_id, &viewer).await;

        fx.relay
            .handle(
                stream_id,
                &viewer,
                envelope(SignalKind::Answer, viewer.user_id, None),
            )
            .await
            .unwrap();

        match host_rx.recv().await.unwrap() {
            ServerFrame::Signal { envelope } => assert_eq!(envelope.kind, SignalKind::Answer),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_answer_fails_when_host_gone() {
        let fx = fixture();
        let stream_id = Uuid::new_v4();
        let viewer = identity(ParticipantRole::Participant);
        let _viewer_rx = register(&fx, stream_id, &viewer).await;

        let err = fx
            .relay
            .handle(
                stream_id,
                &viewer,
                envelope(SignalKind::Answer, viewer.user_id, None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_candidate_to_missing_target_is_dropped() {
        let fx = fixture();
        let stream_id = Uuid::new_v4();
        let host = identity(ParticipantRole::Host);
        let _host_rx = register(&fx, stream_id, &host).await;

        let outcome = fx
            .relay
            .handle(
                stream_id,
                &host,
                envelope(SignalKind::Candidate, host.user_id, Some(Uuid::new_v4())),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, SignalOutcome::Ack));
    }

    #[tokio::test]
    async fn test_leave_unregisters_and_notifies() {
        let fx = fixture();
        let stream_id = Uuid::new_v4();
        let host = identity(ParticipantRole::Host);
        let viewer = identity(ParticipantRole::Participant);
        let mut host_rx = register(&fx, stream_id, &host).await;
        let _viewer_rx = register(&fx, stream_id, &viewer).await;

        fx.relay
            .handle(
                stream_id,
                &viewer,
                envelope(SignalKind::Leave, viewer.user_id, None),
            )
            .await
            .unwrap();

        match host_rx.recv().await.unwrap() {
            ServerFrame::ParticipantLeft { user_id, reason } => {
                assert_eq!(user_id, viewer.user_id);
                assert_eq!(reason, LeaveReason::SelfLeft);
            },
            other => panic!("unexpected frame {other:?}"),
        }

        let room = fx.registry.get(stream_id).unwrap();
        assert!(room.find_host().await.unwrap().is_some());
        let snapshot = room.snapshot().await.unwrap();
        assert!(snapshot.iter().all(|c| c.user_id != viewer.user_id));
    }
}

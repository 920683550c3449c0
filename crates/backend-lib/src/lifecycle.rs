// ============================
// crates/backend-lib/src/lifecycle.rs
// ============================
//! Session lifecycle controller.
//!
//! Owns every state transition of a session document and the attendance
//! bookkeeping around it. The store only does whole-document reads and
//! writes, so each read-modify-write here runs under a per-session async
//! mutex; the lock is held across the store round-trip but never across a
//! transport send.

use crate::auth::Identity;
use crate::config::{IceSettings, RateLimitSettings};
use crate::enrollment::EnrollmentProvider;
use crate::error::AppError;
use crate::model::{
    LivestreamSession, ParticipantRecord, RecordingRef, SessionSettings, SessionStatistics,
    SessionStatus,
};
use crate::rate_limit::RateLimitPolicy;
use crate::store::SessionStore;
use crate::validation;
use chrono::Utc;
use dashmap::DashMap;
use livecast_common::{
    ChatKind, ChatMessage, CreateSessionRequest, DenyReason, IceServer, JoinDecision, LeaveReason,
    ModerationAction, ParticipantRole,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Pause before the single retry of a failed statistics write.
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Dashboard view of a session's current room and aggregates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RoomSnapshot {
    pub participants: Vec<ParticipantRecord>,
    pub statistics: SessionStatistics,
}

pub struct LifecycleController {
    store: Arc<dyn SessionStore>,
    enrollment: Arc<dyn EnrollmentProvider>,
    rate_limit: RateLimitPolicy,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    ice_servers: Vec<IceServer>,
    default_max_participants: u32,
    op_timeout: Duration,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn SessionStore>,
        enrollment: Arc<dyn EnrollmentProvider>,
        rate_limit: &RateLimitSettings,
        ice: &IceSettings,
        default_max_participants: u32,
        op_timeout: Duration,
    ) -> Self {
        Self {
            store,
            enrollment,
            rate_limit: RateLimitPolicy::new(
                Duration::from_millis(rate_limit.window_ms),
                rate_limit.max_requests,
            ),
            locks: DashMap::new(),
            ice_servers: build_ice_servers(ice),
            default_max_participants,
            op_timeout,
        }
    }

    /// ICE configuration handed to peers at admission and on `host-ready`.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.clone()
    }

    fn session_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, id: Uuid) -> Result<LivestreamSession, AppError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id}")))
    }

    /// Load the session and verify ownership. A host id mismatch reports
    /// `NotFound` rather than `Forbidden` so callers cannot probe for
    /// other hosts' session ids.
    async fn load_owned(&self, id: Uuid, host_id: Uuid) -> Result<LivestreamSession, AppError> {
        let session = self.load(id).await?;
        if session.host_id != host_id {
            return Err(AppError::NotFound(format!("session {id}")));
        }
        Ok(session)
    }

    /// One retry with backoff for statistics-bearing writes; anything
    /// non-transient surfaces immediately.
    async fn save_with_retry(&self, session: &LivestreamSession) -> Result<(), AppError> {
        match self.store.save(session).await {
            Err(err) if err.is_transient() => {
                tracing::warn!(session_id = %session.id, %err, "save failed, retrying once");
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.store.save(session).await
            },
            other => other,
        }
    }

    fn effective_max_participants(&self, settings: &SessionSettings) -> u32 {
        settings
            .max_participants
            .unwrap_or(self.default_max_participants)
    }

    pub async fn create_session(
        &self,
        host: &Identity,
        req: CreateSessionRequest,
    ) -> Result<LivestreamSession, AppError> {
        if host.role != ParticipantRole::Host {
            return Err(AppError::Forbidden(
                "only a host may create sessions".to_string(),
            ));
        }
        if !self.rate_limit.check_and_record(&host.user_id.to_string()) {
            return Err(AppError::RateLimited);
        }

        let title = validation::validate_title(&req.title)?.to_string();

        let mut session = LivestreamSession::new(host.user_id, title);
        session.course_id = req.course_id;
        session.is_public = req.is_public;
        session.scheduled_for = req.scheduled_for;
        session.status = match req.scheduled_for {
            Some(at) if at > Utc::now() => SessionStatus::Scheduled,
            _ => SessionStatus::Created,
        };
        if let Some(patch) = &req.settings {
            validate_settings_patch(patch)?;
            session.settings.apply(patch);
        }

        self.store.insert(&session).await?;
        metrics::counter!(crate::metrics::SESSION_CREATED).increment(1);
        tracing::info!(session_id = %session.id, host_id = %host.user_id, "session created");
        Ok(session)
    }

    pub async fn start_session(
        &self,
        session_id: Uuid,
        host_id: Uuid,
    ) -> Result<LivestreamSession, AppError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self.load_owned(session_id, host_id).await?;
        if !session.status.can_start() {
            return Err(AppError::InvalidState(format!(
                "cannot start a session in state {:?}",
                session.status
            )));
        }

        session.status = SessionStatus::Live;
        session.started_at = Some(Utc::now());
        self.store.save(&session).await?;

        metrics::counter!(crate::metrics::SESSION_STARTED).increment(1);
        tracing::info!(session_id = %session.id, "session live");
        Ok(session)
    }

    /// End a live session. Every open attendance record is closed in the
    /// same write: `self` for the host (it was their own action),
    /// `connection_lost` for everyone else.
    pub async fn end_session(
        &self,
        session_id: Uuid,
        host_id: Uuid,
    ) -> Result<LivestreamSession, AppError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self.load_owned(session_id, host_id).await?;
        if session.status != SessionStatus::Live {
            return Err(AppError::InvalidState(format!(
                "cannot end a session in state {:?}",
                session.status
            )));
        }

        let now = Utc::now();
        session.status = SessionStatus::Ended;
        session.ended_at = Some(now);
        for record in session.participants.iter_mut().filter(|p| p.is_active()) {
            record.left_at = Some(now);
            record.left_reason = Some(if record.user_id == host_id {
                LeaveReason::SelfLeft
            } else {
                LeaveReason::ConnectionLost
            });
        }
        session.recompute_average_watch_time();

        self.save_with_retry(&session).await?;
        self.store.archive(session.id).await?;
        self.locks.remove(&session_id);

        metrics::counter!(crate::metrics::SESSION_ENDED).increment(1);
        tracing::info!(session_id = %session.id, "session ended");
        Ok(session)
    }

    /// Cancel a session that never went live.
    pub async fn cancel_session(
        &self,
        session_id: Uuid,
        host_id: Uuid,
    ) -> Result<LivestreamSession, AppError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self.load_owned(session_id, host_id).await?;
        if !session.status.can_cancel() {
            return Err(AppError::InvalidState(format!(
                "cannot cancel a session in state {:?}",
                session.status
            )));
        }

        session.status = SessionStatus::Cancelled;
        session.ended_at = Some(Utc::now());
        self.store.save(&session).await?;
        self.store.archive(session.id).await?;
        self.locks.remove(&session_id);

        tracing::info!(session_id = %session.id, "session cancelled");
        Ok(session)
    }

    pub async fn update_settings(
        &self,
        session_id: Uuid,
        host_id: Uuid,
        patch: &livecast_common::SettingsPatch,
    ) -> Result<LivestreamSession, AppError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self.load_owned(session_id, host_id).await?;
        if session.status.is_terminal() {
            return Err(AppError::InvalidState(
                "session is already over".to_string(),
            ));
        }

        validate_settings_patch(patch)?;
        session.settings.apply(patch);
        self.store.save(&session).await?;
        Ok(session)
    }

    /// Admission pre-check, bounded by the operation timeout.
    ///
    /// This is advisory: passing here does not reserve a slot. The room
    /// actor repeats the capacity check against live connections at
    /// registration, which is the serialization point.
    pub async fn evaluate_join_eligibility(
        &self,
        session_id: Uuid,
        identity: &Identity,
    ) -> Result<JoinDecision, AppError> {
        let decision = tokio::time::timeout(
            self.op_timeout,
            self.evaluate_join_inner(session_id, identity),
        )
        .await
        .map_err(|_| AppError::Timeout("join eligibility check".to_string()))??;

        if let JoinDecision::Denied { reason } = &decision {
            metrics::counter!(crate::metrics::JOIN_DENIED).increment(1);
            tracing::debug!(%session_id, user_id = %identity.user_id, ?reason, "join denied");
        }
        Ok(decision)
    }

    async fn evaluate_join_inner(
        &self,
        session_id: Uuid,
        identity: &Identity,
    ) -> Result<JoinDecision, AppError> {
        let Some(session) = self.store.get(session_id).await? else {
            return Ok(JoinDecision::Denied {
                reason: DenyReason::NotLive,
            });
        };
        if session.status != SessionStatus::Live {
            return Ok(JoinDecision::Denied {
                reason: DenyReason::NotLive,
            });
        }

        // Externally hosted sessions admit unconditionally with a redirect
        // instead of a native peer connection.
        if let Some(external) = &session.settings.external {
            return Ok(JoinDecision::Redirect {
                platform: external.platform.clone(),
                meeting_url: external.meeting_url.clone(),
                passcode: external.passcode.clone(),
            });
        }

        if identity.role == ParticipantRole::Participant {
            let active = session
                .active_participants()
                .filter(|p| p.role == ParticipantRole::Participant)
                .count() as u32;
            if active >= self.effective_max_participants(&session.settings) {
                return Ok(JoinDecision::Denied {
                    reason: DenyReason::Full,
                });
            }

            if let Some(course_id) = session.course_id {
                if !session.is_public
                    && !self.enrollment.is_enrolled(identity.user_id, course_id).await?
                {
                    return Ok(JoinDecision::Denied {
                        reason: DenyReason::NotEnrolled,
                    });
                }
            }
        }

        Ok(JoinDecision::Allowed {
            ice_servers: self.ice_servers(),
            // filled in by the caller from the room's registered host
            host_id: None,
            mute_on_entry: session.settings.mute_on_entry,
        })
    }

    /// Append an attendance record after the room has admitted the
    /// connection. A stale open record from a dropped transport is closed
    /// first so the no-duplicate-active invariant holds across rejoins.
    pub async fn record_join(
        &self,
        session_id: Uuid,
        identity: &Identity,
        device_info: Option<String>,
    ) -> Result<ParticipantRecord, AppError> {
        let display_name = validation::validate_display_name(&identity.display_name)?.to_string();

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self.load(session_id).await?;
        if session.status != SessionStatus::Live {
            return Err(AppError::InvalidState(
                "session is not live".to_string(),
            ));
        }

        let now = Utc::now();
        if session.close_participant(identity.user_id, now, LeaveReason::ConnectionLost) {
            tracing::debug!(
                %session_id,
                user_id = %identity.user_id,
                "closed stale record on rejoin"
            );
        }

        let record = ParticipantRecord {
            user_id: identity.user_id,
            display_name,
            role: identity.role,
            joined_at: now,
            left_at: None,
            left_reason: None,
            device_info,
        };
        session.participants.push(record.clone());
        session.statistics.total_views += 1;
        session.bump_peak_concurrent();

        self.save_with_retry(&session).await?;
        metrics::counter!(crate::metrics::JOIN_ADMITTED).increment(1);
        Ok(record)
    }

    /// Close a user's open attendance record. Idempotent: a second call
    /// for the same departure is a no-op, and a missing session is treated
    /// as already reconciled so disconnect cleanup never fails the caller.
    pub async fn record_leave(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        reason: LeaveReason,
    ) -> Result<(), AppError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let Some(mut session) = self.store.get(session_id).await? else {
            tracing::debug!(%session_id, %user_id, "leave for unknown session ignored");
            return Ok(());
        };

        if !session.close_participant(user_id, Utc::now(), reason) {
            return Ok(());
        }
        session.recompute_average_watch_time();
        self.save_with_retry(&session).await?;

        tracing::debug!(%session_id, %user_id, ?reason, "participant departed");
        Ok(())
    }

    /// Host-initiated removal. The caller owes the removed user a
    /// force-disconnect through the broadcaster after this returns.
    pub async fn remove_participant(
        &self,
        session_id: Uuid,
        host_id: Uuid,
        target_user_id: Uuid,
    ) -> Result<(), AppError> {
        let session = self.load(session_id).await?;
        if session.host_id != host_id {
            return Err(AppError::Forbidden(
                "only the host may remove participants".to_string(),
            ));
        }
        self.record_leave(session_id, target_user_id, LeaveReason::RemovedByHost)
            .await
    }

    /// Persist one chat message, enforcing the session's feature gates.
    /// Fan-out is the broadcaster's job; this only owns the document.
    pub async fn append_chat(
        &self,
        session_id: Uuid,
        sender: &Identity,
        body: &str,
        kind: ChatKind,
    ) -> Result<ChatMessage, AppError> {
        let body = validation::sanitize_string(validation::validate_chat_body(body)?);

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self.load(session_id).await?;
        if session.status != SessionStatus::Live {
            return Err(AppError::InvalidState(
                "session is not live".to_string(),
            ));
        }
        match kind {
            ChatKind::Chat if !session.settings.is_chat_enabled => {
                return Err(AppError::Forbidden("chat is disabled".to_string()));
            },
            ChatKind::Question if !session.settings.is_questions_enabled => {
                return Err(AppError::Forbidden("questions are disabled".to_string()));
            },
            _ => {},
        }

        let message = ChatMessage {
            id: Uuid::new_v4(),
            user_id: sender.user_id,
            display_name: sender.display_name.clone(),
            role: sender.role,
            body,
            kind,
            timestamp: Utc::now(),
            is_pinned: false,
            is_highlighted: false,
            is_deleted: false,
        };
        session.chat.push(message.clone());
        session.statistics.total_interactions += 1;

        self.save_with_retry(&session).await?;
        metrics::counter!(crate::metrics::CHAT_MESSAGES).increment(1);
        Ok(message)
    }

    /// Apply a moderation action to a stored message and return the
    /// updated copy. Moderators may do anything; the message owner may
    /// only delete their own message.
    pub async fn moderate_chat(
        &self,
        session_id: Uuid,
        actor: &Identity,
        message_id: Uuid,
        action: ModerationAction,
    ) -> Result<ChatMessage, AppError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self.load(session_id).await?;
        let updated = {
            let message = session
                .chat_message_mut(message_id)
                .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;

            let owner_delete =
                action == ModerationAction::Delete && message.user_id == actor.user_id;
            if !actor.role.can_moderate() && !owner_delete {
                return Err(AppError::Forbidden(
                    "not permitted to moderate this message".to_string(),
                ));
            }

            match action {
                ModerationAction::Pin => message.is_pinned = true,
                ModerationAction::Unpin => message.is_pinned = false,
                ModerationAction::Highlight => message.is_highlighted = true,
                ModerationAction::Unhighlight => message.is_highlighted = false,
                ModerationAction::Delete => message.is_deleted = true,
            }
            message.clone()
        };

        self.save_with_retry(&session).await?;
        Ok(updated)
    }

    /// Attach a processed recording to the session.
    pub async fn add_recording(
        &self,
        session_id: Uuid,
        host_id: Uuid,
        recording: RecordingRef,
    ) -> Result<LivestreamSession, AppError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let mut session = self.load_owned(session_id, host_id).await?;
        session.recordings.push(recording);
        self.store.save(&session).await?;
        Ok(session)
    }

    pub async fn list_sessions(
        &self,
        host_id: Option<Uuid>,
        status: Option<SessionStatus>,
    ) -> Result<Vec<LivestreamSession>, AppError> {
        self.store.list(host_id, status).await
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<LivestreamSession, AppError> {
        self.load(session_id).await
    }

    /// Active roster plus aggregates, for dashboards.
    pub async fn room_snapshot(&self, session_id: Uuid) -> Result<RoomSnapshot, AppError> {
        let session = self.load(session_id).await?;
        Ok(RoomSnapshot {
            participants: session
                .participants
                .iter()
                .filter(|p| p.is_active())
                .cloned()
                .collect(),
            statistics: session.statistics,
        })
    }

    /// Participant cap for the room actor's admission check.
    pub async fn participant_cap(&self, session_id: Uuid) -> Result<u32, AppError> {
        let session = self.load(session_id).await?;
        Ok(self.effective_max_participants(&session.settings))
    }

    /// Drop stale rate-limit windows. Invoked from the reaper's sweep so
    /// the per-user window map does not grow without bound.
    pub fn cleanup_rate_limits(&self) {
        self.rate_limit.cleanup();
    }

    #[cfg(test)]
    pub(crate) fn rate_limit_tracked_keys(&self) -> usize {
        self.rate_limit.tracked_keys()
    }
}

fn validate_settings_patch(patch: &livecast_common::SettingsPatch) -> Result<(), AppError> {
    if let Some(url) = &patch.meeting_url {
        validation::validate_meeting_url(url)?;
    }
    if patch.max_participants == Some(0) {
        return Err(AppError::Validation(
            "max_participants must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn build_ice_servers(ice: &IceSettings) -> Vec<IceServer> {
    let mut servers = vec![IceServer {
        urls: ice.stun_urls.clone(),
        username: None,
        credential: None,
    }];
    // TURN only when credentials are configured
    if let (Some(url), Some(username), Some(credential)) =
        (&ice.turn_url, &ice.turn_username, &ice.turn_credential)
    {
        servers.push(IceServer {
            urls: vec![url.clone()],
            username: Some(username.clone()),
            credential: Some(credential.clone()),
        });
    }
    servers
}

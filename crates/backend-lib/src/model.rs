// ============================
// crates/backend-lib/src/model.rs
// ============================
//! Persistent data model: the livestream session document and its embedded
//! participant roster, chat log, recordings and statistics.

use chrono::{DateTime, Utc};
use livecast_common::{ChatMessage, LeaveReason, ParticipantRole, SettingsPatch};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a session.
///
/// The only normal path is `Scheduled`/`Created` → `Live` → `Ended`.
/// `Cancelled` is reachable from the pre-`Live` states only.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Created,
    Live,
    Ended,
    Cancelled,
}

impl SessionStatus {
    /// Whether the session can still transition to `Live`.
    pub fn can_start(self) -> bool {
        matches!(self, SessionStatus::Scheduled | SessionStatus::Created)
    }

    /// Whether the session can still be cancelled.
    pub fn can_cancel(self) -> bool {
        matches!(self, SessionStatus::Scheduled | SessionStatus::Created)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Cancelled)
    }
}

/// External platform details for sessions not natively hosted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExternalPlatform {
    pub platform: String,
    pub meeting_url: String,
    pub passcode: Option<String>,
}

/// Structured session configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionSettings {
    pub is_chat_enabled: bool,
    pub is_questions_enabled: bool,
    pub allow_replay: bool,
    /// `None` means the server default applies.
    pub max_participants: Option<u32>,
    pub waiting_room_enabled: bool,
    pub auto_admit: bool,
    pub mute_on_entry: bool,
    /// Present when the session is hosted on an external platform.
    pub external: Option<ExternalPlatform>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            is_chat_enabled: true,
            is_questions_enabled: true,
            allow_replay: true,
            max_participants: None,
            waiting_room_enabled: false,
            auto_admit: true,
            mute_on_entry: false,
            external: None,
        }
    }
}

impl SessionSettings {
    /// Apply a partial update; absent fields keep their current value.
    /// Setting `platform` + `meeting_url` together switches the session to
    /// external hosting.
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(v) = patch.is_chat_enabled {
            self.is_chat_enabled = v;
        }
        if let Some(v) = patch.is_questions_enabled {
            self.is_questions_enabled = v;
        }
        if let Some(v) = patch.allow_replay {
            self.allow_replay = v;
        }
        if let Some(v) = patch.max_participants {
            self.max_participants = Some(v);
        }
        if let Some(v) = patch.waiting_room_enabled {
            self.waiting_room_enabled = v;
        }
        if let Some(v) = patch.auto_admit {
            self.auto_admit = v;
        }
        if let Some(v) = patch.mute_on_entry {
            self.mute_on_entry = v;
        }
        if let (Some(platform), Some(meeting_url)) = (&patch.platform, &patch.meeting_url) {
            self.external = Some(ExternalPlatform {
                platform: platform.clone(),
                meeting_url: meeting_url.clone(),
                passcode: patch.passcode.clone(),
            });
        }
    }
}

/// One attendance interval of one user. Created on join, closed in place on
/// departure, never deleted.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ParticipantRecord {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub left_reason: Option<LeaveReason>,
    pub device_info: Option<String>,
}

impl ParticipantRecord {
    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

/// A processed recording attached to a session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RecordingRef {
    pub filename: String,
    pub url: String,
    pub status: RecordingStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Processing,
    Ready,
    Failed,
}

/// Monotonically updated aggregates.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SessionStatistics {
    pub total_views: u64,
    pub peak_concurrent: u32,
    /// Mean of `left_at - joined_at` in seconds over departed records.
    pub average_watch_time_secs: f64,
    pub total_interactions: u64,
}

/// The persisted session document. Participants, chat and recordings are
/// embedded ordered collections, append-only during the session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LivestreamSession {
    pub id: Uuid,
    pub host_id: Uuid,
    pub title: String,
    pub course_id: Option<Uuid>,
    pub status: SessionStatus,
    pub is_public: bool,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub settings: SessionSettings,
    pub participants: Vec<ParticipantRecord>,
    pub chat: Vec<ChatMessage>,
    pub recordings: Vec<RecordingRef>,
    pub statistics: SessionStatistics,
}

impl LivestreamSession {
    pub fn new(host_id: Uuid, title: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            host_id,
            title,
            course_id: None,
            status: SessionStatus::Created,
            is_public: false,
            scheduled_for: None,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
            settings: SessionSettings::default(),
            participants: Vec::new(),
            chat: Vec::new(),
            recordings: Vec::new(),
            statistics: SessionStatistics::default(),
        }
    }

    /// Participants with no departure recorded.
    pub fn active_participants(&self) -> impl Iterator<Item = &ParticipantRecord> {
        self.participants.iter().filter(|p| p.is_active())
    }

    pub fn active_count(&self) -> u32 {
        self.active_participants().count() as u32
    }

    /// The open attendance record of a user, if any. At most one exists.
    pub fn active_record_mut(&mut self, user_id: Uuid) -> Option<&mut ParticipantRecord> {
        self.participants
            .iter_mut()
            .find(|p| p.user_id == user_id && p.is_active())
    }

    pub fn chat_message_mut(&mut self, message_id: Uuid) -> Option<&mut ChatMessage> {
        self.chat.iter_mut().find(|m| m.id == message_id)
    }

    /// Close a user's open record. Returns `false` when no record was
    /// active, which makes departure recording idempotent.
    pub fn close_participant(
        &mut self,
        user_id: Uuid,
        left_at: DateTime<Utc>,
        reason: LeaveReason,
    ) -> bool {
        match self.active_record_mut(user_id) {
            Some(record) => {
                record.left_at = Some(left_at);
                record.left_reason = Some(reason);
                true
            },
            None => false,
        }
    }

    /// Canonical peak computation: never below the currently active count.
    pub fn bump_peak_concurrent(&mut self) {
        let active = self.active_count();
        if active > self.statistics.peak_concurrent {
            self.statistics.peak_concurrent = active;
        }
    }

    /// Recompute the mean watch time over departed records.
    pub fn recompute_average_watch_time(&mut self) {
        let mut total_secs = 0.0_f64;
        let mut departed = 0u32;
        for p in &self.participants {
            if let Some(left_at) = p.left_at {
                total_secs += (left_at - p.joined_at).num_milliseconds() as f64 / 1000.0;
                departed += 1;
            }
        }
        self.statistics.average_watch_time_secs = if departed == 0 {
            0.0
        } else {
            total_secs / f64::from(departed)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn participant(user_id: Uuid) -> ParticipantRecord {
        ParticipantRecord {
            user_id,
            display_name: "viewer".to_string(),
            role: ParticipantRole::Participant,
            joined_at: Utc::now(),
            left_at: None,
            left_reason: None,
            device_info: None,
        }
    }

    #[test]
    fn test_status_transitions() {
        assert!(SessionStatus::Scheduled.can_start());
        assert!(SessionStatus::Created.can_start());
        assert!(!SessionStatus::Live.can_start());
        assert!(!SessionStatus::Live.can_cancel());
        assert!(!SessionStatus::Ended.can_cancel());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_peak_never_below_active() {
        let mut session = LivestreamSession::new(Uuid::new_v4(), "test".to_string());
        session.participants.push(participant(Uuid::new_v4()));
        session.participants.push(participant(Uuid::new_v4()));
        session.bump_peak_concurrent();
        assert_eq!(session.statistics.peak_concurrent, 2);

        let gone = session.participants[0].user_id;
        session.close_participant(gone, Utc::now(), LeaveReason::SelfLeft);
        session.bump_peak_concurrent();
        // monotonic: departure does not lower the peak
        assert_eq!(session.statistics.peak_concurrent, 2);
        assert_eq!(session.active_count(), 1);
    }

    #[test]
    fn test_close_participant_idempotent() {
        let mut session = LivestreamSession::new(Uuid::new_v4(), "test".to_string());
        let user = Uuid::new_v4();
        session.participants.push(participant(user));

        assert!(session.close_participant(user, Utc::now(), LeaveReason::SelfLeft));
        assert!(!session.close_participant(user, Utc::now(), LeaveReason::ConnectionLost));
        assert_eq!(
            session.participants[0].left_reason,
            Some(LeaveReason::SelfLeft)
        );
    }

    #[test]
    fn test_average_watch_time() {
        let mut session = LivestreamSession::new(Uuid::new_v4(), "test".to_string());
        let start = Utc::now();
        let mut p1 = participant(Uuid::new_v4());
        p1.joined_at = start;
        p1.left_at = Some(start + Duration::seconds(100));
        let mut p2 = participant(Uuid::new_v4());
        p2.joined_at = start;
        p2.left_at = Some(start + Duration::seconds(200));
        let active = participant(Uuid::new_v4());
        session.participants.extend([p1, p2, active]);

        session.recompute_average_watch_time();
        assert!((session.statistics.average_watch_time_secs - 150.0).abs() < 0.01);
    }

    #[test]
    fn test_settings_patch_switches_to_external() {
        let mut settings = SessionSettings::default();
        settings.apply(&SettingsPatch {
            is_chat_enabled: Some(false),
            platform: Some("zoom".to_string()),
            meeting_url: Some("https://zoom.example/j/1".to_string()),
            ..Default::default()
        });
        assert!(!settings.is_chat_enabled);
        let external = settings.external.expect("external platform set");
        assert_eq!(external.platform, "zoom");
    }
}

// ================
// crates/common/src/lib.rs
// ================
//! Common types and structures shared between livecast clients and the
//! server: the WebSocket frame protocol, the WebRTC signaling envelope,
//! join decisions, and the chat/presence payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a connected user inside a session.
///
/// Only a `Host` may start/end sessions, moderate chat and originate the
/// media offer. `CoHost` shares moderation rights but not lifecycle control.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ParticipantRole {
    Host,
    CoHost,
    Participant,
}

impl ParticipantRole {
    /// Whether this role carries moderation rights.
    pub fn can_moderate(self) -> bool {
        matches!(self, ParticipantRole::Host | ParticipantRole::CoHost)
    }
}

/// Why a participant record was closed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    #[serde(rename = "self")]
    SelfLeft,
    RemovedByHost,
    CapacityLimit,
    ConnectionLost,
}

/// Kind of chat payload.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Chat,
    Question,
    System,
}

/// A chat message as persisted and as relayed to the room.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatMessage {
    pub id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub role: ParticipantRole,
    pub body: String,
    pub kind: ChatKind,
    pub timestamp: DateTime<Utc>,
    pub is_pinned: bool,
    pub is_highlighted: bool,
    pub is_deleted: bool,
}

/// Host/co-host action on a stored chat message. `Delete` is also allowed
/// for the message owner.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    Pin,
    Unpin,
    Highlight,
    Unhighlight,
    Delete,
}

/// The WebRTC handshake message types the relay understands.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Leave,
    HostReady,
    Join,
}

/// One signaling message in flight. `payload` carries opaque SDP/ICE data;
/// the relay never inspects it. `to_user_id == None` means "the host" for
/// answers and "unaddressed" for offers (cache only).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignalEnvelope {
    pub kind: SignalKind,
    pub from_user_id: Uuid,
    pub to_user_id: Option<Uuid>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One ICE server entry handed to joining peers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Outcome of a relay operation, returned to the sender.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignalOutcome {
    /// Message accepted (and forwarded where applicable).
    Ack,
    /// Reply to `host-ready`: the ICE configuration to use.
    IceConfig { ice_servers: Vec<IceServer> },
    /// Reply to `join`: ICE configuration, the registered host, and the
    /// host's cached offer if one was published before this peer arrived.
    JoinAccepted {
        ice_servers: Vec<IceServer>,
        host_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        pending_offer: Option<serde_json::Value>,
    },
    /// Join-style requests that cannot proceed (`no_host`).
    Rejected { reason: DenyReason },
}

/// Specific reasons a join is refused, so clients can render a message
/// rather than a generic error.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotLive,
    Full,
    NotEnrolled,
    NoHost,
}

/// Result of a join request against a session, exhaustively checkable by
/// the caller instead of a bag of optional fields.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JoinDecision {
    Allowed {
        ice_servers: Vec<IceServer>,
        host_id: Option<Uuid>,
        mute_on_entry: bool,
    },
    /// The session is hosted on an external platform; the client should
    /// redirect instead of negotiating a native peer connection.
    Redirect {
        platform: String,
        meeting_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        passcode: Option<String>,
    },
    Denied { reason: DenyReason },
}

/// Ephemeral room events fanned out to every connection but never
/// persisted, unlike chat.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    HandRaised { user_id: Uuid, raised: bool },
    Reaction { user_id: Uuid, emoji: String },
    DeviceStatus {
        user_id: Uuid,
        mic_on: bool,
        camera_on: bool,
    },
}

/// Messages sent from client to server over the room WebSocket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "msgType")]
pub enum ClientFrame {
    /// WebRTC handshake traffic for the signaling relay.
    Signal { envelope: SignalEnvelope },
    /// Post a chat message or question.
    Chat { body: String, kind: ChatKind },
    /// Moderate a stored chat message.
    Moderate {
        message_id: Uuid,
        action: ModerationAction,
    },
    /// Ephemeral presence event (hand raise, reaction, device status).
    Presence { event: PresenceEvent },
    /// Liveness ping for otherwise-idle viewers.
    Heartbeat,
}

/// Messages sent from server to client over the room WebSocket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "msgType")]
pub enum ServerFrame {
    /// Sent once after admission.
    Joined {
        stream_id: Uuid,
        user_id: Uuid,
        role: ParticipantRole,
        ice_servers: Vec<IceServer>,
        host_id: Option<Uuid>,
        mute_on_entry: bool,
    },
    /// Admission refused; the socket closes after this frame.
    JoinRejected { reason: DenyReason },
    /// Forwarded signaling traffic.
    Signal { envelope: SignalEnvelope },
    /// Direct reply to a signaling request from this connection.
    SignalResult { outcome: SignalOutcome },
    /// New chat message accepted by the broadcaster.
    Chat { message: ChatMessage },
    /// A stored chat message changed through moderation.
    ChatUpdated { message: ChatMessage },
    /// Ephemeral presence fan-out.
    Presence { event: PresenceEvent },
    ParticipantJoined {
        user_id: Uuid,
        display_name: String,
        role: ParticipantRole,
    },
    ParticipantLeft {
        user_id: Uuid,
        reason: LeaveReason,
    },
    /// The session ended; no further frames follow.
    SessionEnded { stream_id: Uuid },
    /// This connection is being closed by the server (removal,
    /// superseded login). The socket closes after this frame.
    ForceDisconnect { reason: LeaveReason },
    Error { code: String, message: String },
}

/// Request body for creating a session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateSessionRequest {
    pub title: String,
    #[serde(default)]
    pub course_id: Option<Uuid>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub settings: Option<SettingsPatch>,
}

/// Partial settings update; absent fields are left unchanged.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SettingsPatch {
    pub is_chat_enabled: Option<bool>,
    pub is_questions_enabled: Option<bool>,
    pub allow_replay: Option<bool>,
    pub max_participants: Option<u32>,
    pub waiting_room_enabled: Option<bool>,
    pub auto_admit: Option<bool>,
    pub mute_on_entry: Option<bool>,
    pub platform: Option<String>,
    pub meeting_url: Option<String>,
    pub passcode: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_serialization() {
        let frame = ClientFrame::Chat {
            body: "hello".to_string(),
            kind: ChatKind::Question,
        };

        let json = serde_json::to_string(&frame).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["msgType"], "Chat");
        assert_eq!(parsed["body"], "hello");
        assert_eq!(parsed["kind"], "question");

        let round: ClientFrame = serde_json::from_str(&json).unwrap();
        match round {
            ClientFrame::Chat { body, kind } => {
                assert_eq!(body, "hello");
                assert_eq!(kind, ChatKind::Question);
            },
            other => panic!("Wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_signal_kind_wire_names() {
        let json = serde_json::to_string(&SignalKind::HostReady).unwrap();
        assert_eq!(json, "\"host-ready\"");
        let kind: SignalKind = serde_json::from_str("\"candidate\"").unwrap();
        assert_eq!(kind, SignalKind::Candidate);
    }

    #[test]
    fn test_leave_reason_self_rename() {
        assert_eq!(
            serde_json::to_string(&LeaveReason::SelfLeft).unwrap(),
            "\"self\""
        );
        assert_eq!(
            serde_json::to_string(&LeaveReason::RemovedByHost).unwrap(),
            "\"removed_by_host\""
        );
    }

    #[test]
    fn test_join_decision_tagged_shape() {
        let decision = JoinDecision::Denied {
            reason: DenyReason::NotEnrolled,
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&decision).unwrap()).unwrap();
        assert_eq!(parsed["result"], "denied");
        assert_eq!(parsed["reason"], "not_enrolled");
    }

    #[test]
    fn test_signal_envelope_default_payload() {
        let json = r#"{"kind":"leave","from_user_id":"7f8de60c-3b8c-4fd4-a1a8-b17f01b1a5c7","to_user_id":null}"#;
        let envelope: SignalEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.kind, SignalKind::Leave);
        assert!(envelope.payload.is_null());
    }
}

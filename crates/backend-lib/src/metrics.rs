// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTED: &str = "ws.connected";
pub const WS_ACTIVE: &str = "ws.active";
pub const SESSION_CREATED: &str = "session.created";
pub const SESSION_STARTED: &str = "session.started";
pub const SESSION_ENDED: &str = "session.ended";
pub const JOIN_ADMITTED: &str = "join.admitted";
pub const JOIN_DENIED: &str = "join.denied";
pub const CHAT_MESSAGES: &str = "chat.messages";
pub const SIGNALS_RELAYED: &str = "signal.relayed";
pub const SIGNALS_DROPPED: &str = "signal.dropped";
pub const CONNECTIONS_REAPED: &str = "room.connections_reaped";
pub const TOKENS_ACTIVE: &str = "auth.tokens_active";

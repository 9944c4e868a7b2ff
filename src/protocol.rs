//! JSON wire protocol for the room relay.
//!
//! Every frame, in both directions, is one JSON object:
//!
//! ```text
//! { "user": "...", "message": "...", "chatroom": "...",
//!   "kill"?: bool, "killRoom"?: bool,
//!   "clientId"?: "...", "clearAllMessages"?: bool }
//! ```
//!
//! Optional fields are omitted from the wire when unset. The `clientId`
//! field is meaningful server→client only: inbound values are logged and
//! discarded, and outbound attribution always carries the id the server
//! assigned at connection time.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display name used for all server-originated notices.
pub const SERVER_USER: &str = "server";

/// A single relay frame.
///
/// The same shape is used for client chat messages, control requests
/// (`kill`, `killRoom`) and server notices; which fields are populated
/// depends on direction and intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Display name of the sender, or [`SERVER_USER`] for notices.
    pub user: String,
    /// Text body.
    pub message: String,
    /// Target/source room name. Coerced to `""` when absent inbound.
    #[serde(default)]
    pub chatroom: String,
    /// Client requests its own disconnect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill: Option<bool>,
    /// Client requests a room-wide history clear.
    #[serde(default, rename = "killRoom", skip_serializing_if = "Option::is_none")]
    pub kill_room: Option<bool>,
    /// Server-assigned identity. Ignored when present on inbound frames.
    #[serde(default, rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Flags a killRoom notice so consuming UIs discard cached history.
    #[serde(
        default,
        rename = "clearAllMessages",
        skip_serializing_if = "Option::is_none"
    )]
    pub clear_all_messages: Option<bool>,
}

impl WireMessage {
    /// Create an ordinary chat frame as a client would send it.
    pub fn chat(user: impl Into<String>, room: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            message: text.into(),
            chatroom: room.into(),
            kill: None,
            kill_room: None,
            client_id: None,
            clear_all_messages: None,
        }
    }

    /// Server notice template: `user = "server"`, optional room, given text.
    fn notice(room: impl Into<String>, text: impl Into<String>, client_id: String) -> Self {
        Self {
            user: SERVER_USER.to_string(),
            message: text.into(),
            chatroom: room.into(),
            kill: None,
            kill_room: None,
            client_id: Some(client_id),
            clear_all_messages: None,
        }
    }

    /// Welcome notice sent once on connection open, carrying the freshly
    /// assigned client id. No room is assigned yet.
    pub fn welcome(client_id: String) -> Self {
        Self::notice("", "Connected! Waiting for room information...", client_id)
    }

    /// Notice to the sender confirming it joined `room`.
    pub fn joined(room: &str, client_id: String) -> Self {
        Self::notice(room, format!("You've joined room {room}"), client_id)
    }

    /// Notice to a room's other members that someone joined.
    pub fn user_joined(room: &str, client_id: String) -> Self {
        Self::notice(room, "A new user joined the chat", client_id)
    }

    /// Notice to a room's remaining members that someone left.
    pub fn user_left(room: &str, client_id: String) -> Self {
        Self::notice(room, "A user left the chat", client_id)
    }

    /// Room-wide history-clear notice. Carries `clearAllMessages: true` and
    /// the requester's client id.
    pub fn room_cleared(room: &str, client_id: String) -> Self {
        let mut msg = Self::notice(
            room,
            "⚠️ THIS ROOM HAS BEEN KILLED - ALL MESSAGES CLEARED ⚠️",
            client_id,
        );
        msg.clear_all_messages = Some(true);
        msg
    }

    /// Error notice sent to the offending sender only.
    pub fn error(text: impl Into<String>, client_id: String) -> Self {
        Self::notice("", text, client_id)
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON wire form.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Generate a server-assigned client id.
///
/// Format is unconstrained by the protocol; only uniqueness over the
/// connection's lifetime matters. A v4 UUID gives that with margin.
pub fn generate_client_id() -> String {
    Uuid::new_v4().to_string()
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

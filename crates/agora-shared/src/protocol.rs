use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::types::{RoomId, UserId};

/// Frames the server writes to a connected client.
///
/// Every frame is a JSON text frame tagged by `"type"`. A chat message
/// looks like `{"type":"message","room_id":7,"user_id":3,"username":"alice","message":"hello",...}`.
///
/// Frames carry their room because a user's single connection receives the
/// traffic of every room they belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A persisted chat message, either live or replayed from history
    Message(ChatFrame),

    /// Join / leave / expel announcement. Never persisted.
    System { room_id: RoomId, message: String },

    /// Error acknowledgement, sent only to the client that caused it
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFrame {
    /// Message Log id, increasing within a room
    pub id: i64,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

impl ServerFrame {
    pub fn system(room_id: RoomId, message: impl Into<String>) -> Self {
        Self::System {
            room_id,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn joined(room_id: RoomId, username: &str) -> Self {
        Self::system(room_id, format!("User {username} joined the room."))
    }

    pub fn left(room_id: RoomId, username: &str) -> Self {
        Self::system(room_id, format!("User {username} left the room."))
    }

    pub fn expelled(room_id: RoomId, username: &str) -> Self {
        Self::system(room_id, format!("User {username} was removed from the room."))
    }

    /// Message Log id for chat frames, `None` for everything else.
    pub fn message_id(&self) -> Option<i64> {
        match self {
            Self::Message(chat) => Some(chat.id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Envelope a client may use instead of a raw text frame.
#[derive(Debug, Clone, Deserialize)]
struct ClientEnvelope {
    message: String,
}

/// Extract the message content from an inbound text frame.
///
/// Clients may send the content as-is or wrapped as `{"message": "..."}`.
/// Anything that does not parse as that envelope is taken verbatim.
pub fn parse_client_text(text: &str) -> String {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(envelope) = serde_json::from_str::<ClientEnvelope>(trimmed) {
            return envelope.message;
        }
    }
    text.to_string()
}

/// Check message content against the length policy.
///
/// Length is counted in characters, not bytes.
pub fn validate_content(content: &str, max_len: usize) -> Result<(), FrameError> {
    if content.trim().is_empty() {
        return Err(FrameError::Empty);
    }
    let len = content.chars().count();
    if len > max_len {
        return Err(FrameError::TooLong { len, max: max_len });
    }
    Ok(())
}

//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` so the HTTP layer can hand it out
//! directly; the few that arrive from clients also derive `Deserialize`.

use agora_shared::types::{RoomId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account. Credentials are opaque to this crate.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing)]
    pub credential_hash: String,
    pub is_active: bool,
    /// Set when the account was deactivated.
    pub inactive_since: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// What a room member listing shows about a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberSummary {
    pub user_id: UserId,
    pub username: String,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub is_private: bool,
    /// Present iff the room is private. Never serialized; the API decides
    /// who gets to see it.
    #[serde(skip_serializing)]
    pub invite_code: Option<String>,
    pub manager_id: Option<UserId>,
    pub category_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn is_managed_by(&self, user_id: UserId) -> bool {
        self.manager_id == Some(user_id)
    }
}

/// Parameters for creating a room.
#[derive(Debug, Clone)]
pub struct NewRoom {
    pub manager_id: UserId,
    pub name: String,
    pub is_private: bool,
    pub category_id: Option<i64>,
}

/// Partial room update. Absent fields are left untouched.
///
/// `category_id` distinguishes "absent" (`None`) from "clear it"
/// (`Some(None)`, i.e. an explicit JSON `null`).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RoomUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "present_or_null")]
    pub category_id: Option<Option<i64>>,
    #[serde(default)]
    pub is_private: Option<bool>,
}

impl RoomUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.category_id.is_none() && self.is_private.is_none()
    }
}

fn present_or_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Membership {
    pub id: i64,
    pub user_id: UserId,
    pub room_id: RoomId,
    pub joined_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single chat message, expanded with the author's username.
///
/// Messages are immutable once written.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub username: String,
    pub content: String,
    /// Server acceptance time.
    pub created_at: DateTime<Utc>,
}

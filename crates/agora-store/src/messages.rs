//! Message Log: append-only history per room.

use agora_shared::protocol::validate_content;
use agora_shared::types::{RoomId, UserId};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::{format_ts, parse_ts, Database};
use crate::error::{Result, StoreError};
use crate::memberships::membership_exists;
use crate::models::Message;
use crate::rooms::get_room_in;

impl Database {
    /// Append a message to `room_id`, stamped with the current server time.
    ///
    /// The author must be a member of the room at the moment of the write.
    pub fn append_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        content: &str,
        max_len: usize,
    ) -> Result<Message> {
        validate_content(content, max_len).map_err(|e| StoreError::InvalidInput(e.to_string()))?;

        let tx = self.conn().unchecked_transaction()?;
        get_room_in(&tx, room_id)?;

        let username: String = tx
            .query_row(
                "SELECT username FROM users WHERE id = ?1",
                params![user_id.0],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::NotFound("user"))?;

        if !membership_exists(&tx, user_id, room_id)? {
            return Err(StoreError::NotAMember);
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO messages (room_id, user_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![room_id.0, user_id.0, content, format_ts(&now)],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Message {
            id,
            room_id,
            user_id,
            username,
            content: content.to_string(),
            created_at: now,
        })
    }

    /// The most recent `limit` messages of `room_id`, oldest first.
    pub fn recent_messages(&self, room_id: RoomId, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(
            "SELECT m.id, m.room_id, m.user_id, u.username, m.content, m.created_at
             FROM messages m
             JOIN users u ON u.id = m.user_id
             WHERE m.room_id = ?1
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![room_id.0, limit], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let created_at: String = row.get(5)?;

    Ok(Message {
        id: row.get(0)?,
        room_id: RoomId(row.get(1)?),
        user_id: UserId(row.get(2)?),
        username: row.get(3)?,
        content: row.get(4)?,
        created_at: parse_ts(5, &created_at)?,
    })
}

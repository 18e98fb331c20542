//! CRUD operations for [`Room`] records.

use agora_shared::constants::{
    INVITE_CODE_ALPHABET, INVITE_CODE_ATTEMPTS, INVITE_CODE_LEN, MAX_PAGE_SIZE,
};
use agora_shared::types::{RoomId, UserId};
use chrono::Utc;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::{format_ts, parse_ts, Database};
use crate::error::{is_unique_violation, Result, StoreError};
use crate::models::{NewRoom, Room, RoomUpdate};

const ROOM_COLUMNS: &str = "id, name, is_private, invite_code, manager_id, category_id, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create a room managed by `new.manager_id`, who is joined to it in the
    /// same transaction.
    ///
    /// Private rooms get a fresh invite code; a code that collides with an
    /// existing room is regenerated up to [`INVITE_CODE_ATTEMPTS`] times.
    pub fn create_room(&self, new: &NewRoom) -> Result<Room> {
        let name = validate_name(&new.name)?;

        let tx = self.conn().unchecked_transaction()?;
        if !self.user_exists(new.manager_id)? {
            return Err(StoreError::NotFound("user"));
        }

        let now = Utc::now();
        let invite_code = if new.is_private {
            Some(insert_with_fresh_code(|code| {
                tx.execute(
                    "INSERT INTO rooms (name, is_private, invite_code, manager_id, category_id, created_at)
                     VALUES (?1, 1, ?2, ?3, ?4, ?5)",
                    params![name, code, new.manager_id.0, new.category_id, format_ts(&now)],
                )
            })?)
        } else {
            tx.execute(
                "INSERT INTO rooms (name, is_private, invite_code, manager_id, category_id, created_at)
                 VALUES (?1, 0, NULL, ?2, ?3, ?4)",
                params![name, new.manager_id.0, new.category_id, format_ts(&now)],
            )?;
            None
        };
        let id = RoomId(tx.last_insert_rowid());

        tx.execute(
            "INSERT INTO memberships (user_id, room_id, joined_at) VALUES (?1, ?2, ?3)",
            params![new.manager_id.0, id.0, format_ts(&now)],
        )?;
        tx.commit()?;

        tracing::info!(room = %id, manager = %new.manager_id, private = new.is_private, "room created");

        Ok(Room {
            id,
            name: name.to_string(),
            is_private: new.is_private,
            invite_code,
            manager_id: Some(new.manager_id),
            category_id: new.category_id,
            created_at: now,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_room(&self, id: RoomId) -> Result<Room> {
        get_room_in(self.conn(), id)
    }

    /// Page through rooms in creation order. `limit` is capped at
    /// [`MAX_PAGE_SIZE`].
    pub fn list_rooms(&self, skip: u32, limit: u32) -> Result<Vec<Room>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms ORDER BY id ASC LIMIT ?1 OFFSET ?2"
        ))?;

        let rows = stmt.query_map(params![limit.min(MAX_PAGE_SIZE), skip], row_to_room)?;

        let mut rooms = Vec::new();
        for row in rows {
            rooms.push(row?);
        }
        Ok(rooms)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply `update` on behalf of `manager_id`.
    ///
    /// Making a room private issues an invite code; making it public drops
    /// the code.
    pub fn update_room(&self, manager_id: UserId, id: RoomId, update: &RoomUpdate) -> Result<Room> {
        let tx = self.conn().unchecked_transaction()?;
        let mut room = get_room_in(&tx, id)?;
        if !room.is_managed_by(manager_id) {
            return Err(StoreError::NotAManager);
        }

        if let Some(name) = &update.name {
            room.name = validate_name(name)?.to_string();
        }
        if let Some(category_id) = update.category_id {
            room.category_id = category_id;
        }

        tx.execute(
            "UPDATE rooms SET name = ?2, category_id = ?3 WHERE id = ?1",
            params![id.0, room.name, room.category_id],
        )?;

        match update.is_private {
            Some(true) if !room.is_private => {
                let code = insert_with_fresh_code(|code| {
                    tx.execute(
                        "UPDATE rooms SET is_private = 1, invite_code = ?2 WHERE id = ?1",
                        params![id.0, code],
                    )
                })?;
                room.is_private = true;
                room.invite_code = Some(code);
            }
            Some(false) if room.is_private => {
                tx.execute(
                    "UPDATE rooms SET is_private = 0, invite_code = NULL WHERE id = ?1",
                    params![id.0],
                )?;
                room.is_private = false;
                room.invite_code = None;
            }
            _ => {}
        }

        tx.commit()?;
        Ok(room)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn get_room_in(conn: &Connection, id: RoomId) -> Result<Room> {
    conn.query_row(
        &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1"),
        params![id.0],
        row_to_room,
    )
    .optional()?
    .ok_or(StoreError::NotFound("room"))
}

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StoreError::InvalidInput("room name is empty".into()));
    }
    Ok(name)
}

/// Generate a random invite code, e.g. `"K7QZ"`.
pub fn generate_invite_code() -> String {
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LEN)
        .map(|_| INVITE_CODE_ALPHABET[rng.gen_range(0..INVITE_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Run `write` with freshly generated codes until one does not violate the
/// unique index. Returns the code that was stored.
fn insert_with_fresh_code<F>(mut write: F) -> Result<String>
where
    F: FnMut(&str) -> rusqlite::Result<usize>,
{
    for attempt in 1..=INVITE_CODE_ATTEMPTS {
        let code = generate_invite_code();
        match write(&code) {
            Ok(_) => return Ok(code),
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(attempt, "invite code collision, regenerating");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::InviteCodeExhausted)
}

fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
    let manager_id: Option<i64> = row.get(4)?;
    let created_at: String = row.get(6)?;

    Ok(Room {
        id: RoomId(row.get(0)?),
        name: row.get(1)?,
        is_private: row.get(2)?,
        invite_code: row.get(3)?,
        manager_id: manager_id.map(UserId),
        category_id: row.get(5)?,
        created_at: parse_ts(6, &created_at)?,
    })
}

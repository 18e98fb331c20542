//! Membership Store: who belongs to which room.
//!
//! Each operation runs in its own transaction so the existence checks and
//! the write they guard cannot interleave with a concurrent writer.

use agora_shared::types::{RoomId, UserId};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::{format_ts, Database};
use crate::error::{is_unique_violation, Result, StoreError};
use crate::models::{MemberSummary, Membership};
use crate::rooms::get_room_in;

impl Database {
    /// Join `user_id` to `room_id`.
    ///
    /// Private rooms require `invite_code` to match the stored code exactly
    /// (case-sensitive). Public rooms ignore it.
    pub fn join_room(
        &self,
        user_id: UserId,
        room_id: RoomId,
        invite_code: Option<&str>,
    ) -> Result<Membership> {
        let tx = self.conn().unchecked_transaction()?;

        if !self.user_exists(user_id)? {
            return Err(StoreError::NotFound("user"));
        }
        let room = get_room_in(&tx, room_id)?;

        if membership_exists(&tx, user_id, room_id)? {
            return Err(StoreError::AlreadyMember);
        }

        if room.is_private && room.invite_code.as_deref() != invite_code {
            tracing::debug!(room = %room_id, user = %user_id, "invite code mismatch");
            return Err(StoreError::InviteCodeMismatch);
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO memberships (user_id, room_id, joined_at) VALUES (?1, ?2, ?3)",
            params![user_id.0, room_id.0, format_ts(&now)],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyMember
            } else {
                StoreError::Sqlite(e)
            }
        })?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        tracing::info!(room = %room_id, user = %user_id, "user joined room");

        Ok(Membership {
            id,
            user_id,
            room_id,
            joined_at: now,
        })
    }

    /// Remove the caller's own membership.
    pub fn leave_room(&self, user_id: UserId, room_id: RoomId) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        if !self.user_exists(user_id)? {
            return Err(StoreError::NotFound("user"));
        }
        get_room_in(&tx, room_id)?;

        delete_membership(&tx, user_id, room_id)?;
        tx.commit()?;

        tracing::info!(room = %room_id, user = %user_id, "user left room");
        Ok(())
    }

    /// Remove `user_id` from `room_id` on behalf of the room's manager.
    pub fn expel_member(&self, manager_id: UserId, room_id: RoomId, user_id: UserId) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        let room = get_room_in(&tx, room_id)?;
        if !self.user_exists(user_id)? {
            return Err(StoreError::NotFound("user"));
        }
        if !room.is_managed_by(manager_id) {
            return Err(StoreError::NotAManager);
        }

        delete_membership(&tx, user_id, room_id)?;
        tx.commit()?;

        tracing::info!(room = %room_id, user = %user_id, manager = %manager_id, "member expelled");
        Ok(())
    }

    /// Members of `room_id` in join order.
    pub fn list_members(&self, room_id: RoomId) -> Result<Vec<MemberSummary>> {
        let tx = self.conn().unchecked_transaction()?;
        get_room_in(&tx, room_id)?;

        let members = {
            let mut stmt = tx.prepare(
                "SELECT u.id, u.username
                 FROM memberships m
                 JOIN users u ON u.id = m.user_id
                 WHERE m.room_id = ?1
                 ORDER BY m.id ASC",
            )?;
            let rows = stmt.query_map(params![room_id.0], |row| {
                Ok(MemberSummary {
                    user_id: UserId(row.get(0)?),
                    username: row.get(1)?,
                })
            })?;

            let mut members = Vec::new();
            for row in rows {
                members.push(row?);
            }
            members
        };
        tx.commit()?;
        Ok(members)
    }

    pub fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool> {
        membership_exists(self.conn(), user_id, room_id)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn membership_exists(conn: &Connection, user_id: UserId, room_id: RoomId) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM memberships WHERE user_id = ?1 AND room_id = ?2",
            params![user_id.0, room_id.0],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn delete_membership(conn: &Connection, user_id: UserId, room_id: RoomId) -> Result<()> {
    let affected = conn.execute(
        "DELETE FROM memberships WHERE user_id = ?1 AND room_id = ?2",
        params![user_id.0, room_id.0],
    )?;
    if affected == 0 {
        return Err(StoreError::NotAMember);
    }
    Ok(())
}

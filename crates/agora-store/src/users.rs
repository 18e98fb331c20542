//! CRUD operations for [`User`] records.

use agora_shared::types::UserId;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::{format_ts, parse_ts, Database};
use crate::error::{is_unique_violation, Result, StoreError};
use crate::models::User;

const USER_COLUMNS: &str = "id, username, credential_hash, is_active, inactive_since, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Register a user. `credential_hash` is stored as given.
    pub fn create_user(&self, username: &str, credential_hash: &str) -> Result<User> {
        let username = username.trim();
        if username.is_empty() {
            return Err(StoreError::InvalidInput("username is empty".into()));
        }

        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO users (username, credential_hash, is_active, created_at)
                 VALUES (?1, ?2, 1, ?3)",
                params![username, credential_hash, format_ts(&now)],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::UsernameTaken(username.to_string())
                } else {
                    StoreError::Sqlite(e)
                }
            })?;

        Ok(User {
            id: UserId(self.conn().last_insert_rowid()),
            username: username.to_string(),
            credential_hash: credential_hash.to_string(),
            is_active: true,
            inactive_since: None,
            created_at: now,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.0],
                row_to_user,
            )
            .optional()?
            .ok_or(StoreError::NotFound("user"))
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                row_to_user,
            )
            .optional()?
            .ok_or(StoreError::NotFound("user"))
    }

    pub(crate) fn user_exists(&self, id: UserId) -> Result<bool> {
        let found = self
            .conn()
            .query_row("SELECT 1 FROM users WHERE id = ?1", params![id.0], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    // ------------------------------------------------------------------
    // Update / delete
    // ------------------------------------------------------------------

    /// Mark a user inactive, stamping the deactivation time. Deactivating an
    /// already inactive user keeps the original timestamp.
    pub fn deactivate_user(&self, id: UserId) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE users
             SET is_active = 0, inactive_since = COALESCE(inactive_since, ?2)
             WHERE id = ?1",
            params![id.0, format_ts(&Utc::now())],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound("user"));
        }
        Ok(())
    }

    /// Delete users that have been inactive since before `cutoff`.
    ///
    /// Their memberships and messages go with them (foreign-key cascade);
    /// rooms they managed become unmanaged. Returns the number of users
    /// removed.
    pub fn purge_inactive_users(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn().execute(
            "DELETE FROM users
             WHERE is_active = 0 AND inactive_since IS NOT NULL AND inactive_since <= ?1",
            params![format_ts(&cutoff)],
        )?;
        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff, "purged inactive users");
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let inactive_since: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;

    Ok(User {
        id: UserId(row.get(0)?),
        username: row.get(1)?,
        credential_hash: row.get(2)?,
        is_active: row.get(3)?,
        inactive_since: inactive_since.map(|s| parse_ts(4, &s)).transpose()?,
        created_at: parse_ts(5, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::database::test_support::{open_temp, public_room, user};
    use crate::error::StoreError;

    #[test]
    fn create_and_fetch_user() {
        let (_dir, db) = open_temp();
        let alice = user(&db, "alice");

        assert_eq!(db.get_user(alice.id).unwrap().username, "alice");
        assert_eq!(db.get_user_by_username("alice").unwrap().id, alice.id);
        assert!(db.get_user(alice.id).unwrap().is_active);
    }

    #[test]
    fn duplicate_username_rejected() {
        let (_dir, db) = open_temp();
        user(&db, "alice");

        let err = db.create_user("alice", "other").unwrap_err();
        assert!(matches!(err, StoreError::UsernameTaken(name) if name == "alice"));
    }

    #[test]
    fn purge_only_removes_long_inactive_users() {
        let (_dir, db) = open_temp();
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let carol = user(&db, "carol");
        let room = public_room(&db, &carol, "lobby");
        db.join_room(alice.id, room.id, None).unwrap();

        db.deactivate_user(alice.id).unwrap();

        // Cut-off before the deactivation: nobody goes.
        let before = chrono::Utc::now() - Duration::days(30);
        assert_eq!(db.purge_inactive_users(before).unwrap(), 0);

        // Cut-off after it: only alice, the inactive one.
        let after = chrono::Utc::now() + Duration::seconds(1);
        assert_eq!(db.purge_inactive_users(after).unwrap(), 1);

        assert!(matches!(db.get_user(alice.id), Err(StoreError::NotFound("user"))));
        assert!(db.get_user(bob.id).is_ok());
        let members = db.list_members(room.id).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, carol.id);
    }
}

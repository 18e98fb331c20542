//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `users`, `rooms`, `memberships` and
//! `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    username        TEXT NOT NULL UNIQUE,
    credential_hash TEXT NOT NULL,            -- opaque, owned by the auth service
    is_active       INTEGER NOT NULL DEFAULT 1,
    inactive_since  TEXT,                     -- RFC-3339, set on deactivation
    created_at      TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Rooms
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    is_private  INTEGER NOT NULL DEFAULT 0,
    invite_code TEXT UNIQUE,                  -- present iff is_private
    manager_id  INTEGER,                      -- nullable FK -> users(id)
    category_id INTEGER,                      -- category records live elsewhere
    created_at  TEXT NOT NULL,

    FOREIGN KEY (manager_id) REFERENCES users(id) ON DELETE SET NULL,
    CHECK ((is_private = 1) = (invite_code IS NOT NULL))
);

-- ----------------------------------------------------------------
-- Memberships
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS memberships (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,  -- join order
    user_id   INTEGER NOT NULL,
    room_id   INTEGER NOT NULL,
    joined_at TEXT NOT NULL,

    UNIQUE (user_id, room_id),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_memberships_room ON memberships(room_id, id);

-- ----------------------------------------------------------------
-- Messages (insert-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id    INTEGER NOT NULL,
    user_id    INTEGER NOT NULL,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL,                 -- server acceptance time

    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_room_ts
    ON messages(room_id, created_at DESC, id DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}

use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The named record (user, room, ...) does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A membership for this (user, room) pair already exists.
    #[error("User is already a member of this room")]
    AlreadyMember,

    /// The user has no membership in the room.
    #[error("User is not a member of this room")]
    NotAMember,

    /// Supplied invite code does not match the private room's code.
    #[error("Invite code does not match")]
    InviteCodeMismatch,

    /// The acting user does not manage the room.
    #[error("Only the room manager may do this")]
    NotAManager,

    /// Username already registered.
    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    /// Rejected input (empty or oversized content, blank names, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Every generated invite code collided with an existing one.
    #[error("Could not generate a unique invite code")]
    InviteCodeExhausted,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Chrono parsing error.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// `true` when `err` is a UNIQUE constraint failure.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

//! # agora-store
//!
//! Persistent storage for Agora, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides the transactional operations the
//! server relies on: the Membership Store (join / leave / expel / list), the
//! Message Log (append / recent history), and room and user records.

pub mod database;
pub mod memberships;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod rooms;
pub mod users;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
pub use rooms::generate_invite_code;

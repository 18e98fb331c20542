//! # agora-server
//!
//! Real-time backend for Agora chat rooms.
//!
//! - **HTTP API** (axum) for rooms, membership and history
//! - **Connection sessions** over websockets, one per user, that replay
//!   recent history on connect and relay messages both ways
//! - **Room broadcaster** that persists each message before fanning it out
//!   to every online member
//! - **Presence registry** mapping users to their live connection
//! - **Per-IP rate limiting** on the HTTP surface

pub mod api;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod presence;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod transport;

//! # agora-shared
//!
//! Types shared between the store and the server: row identifiers, the JSON
//! frames written to websocket clients, and signed access tokens.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod token;
pub mod types;

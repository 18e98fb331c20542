use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Invalid token signature")]
    Invalid,

    #[error("Token has expired")]
    Expired,

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token encoding failed: {0}")]
    Encoding(String),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Empty message")]
    Empty,

    #[error("Message too long: {len} chars (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

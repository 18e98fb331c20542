use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use agora_shared::error::{FrameError, TokenError};
use agora_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid or expired token")]
    AuthInvalid,

    #[error("{0} not found")]
    NotFound(String),

    #[error("User is already a member of this room")]
    AlreadyMember,

    #[error("Invite code does not match")]
    InviteCodeMismatch,

    #[error("Only the room manager may do this")]
    NotAManager,

    #[error("User is not a member of this room")]
    NotAMember,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::AlreadyMember | ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::InviteCodeMismatch
            | ServerError::NotAManager
            | ServerError::NotAMember => StatusCode::FORBIDDEN,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a client. Storage and internal details stay in
    /// the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServerError::Persistence(_) => "Storage temporarily unavailable".to_string(),
            ServerError::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ServerError::NotFound(what.to_string()),
            StoreError::AlreadyMember => ServerError::AlreadyMember,
            StoreError::NotAMember => ServerError::NotAMember,
            StoreError::InviteCodeMismatch => ServerError::InviteCodeMismatch,
            StoreError::NotAManager => ServerError::NotAManager,
            StoreError::UsernameTaken(name) => {
                ServerError::Conflict(format!("username already taken: {name}"))
            }
            StoreError::InvalidInput(msg) => ServerError::BadRequest(msg),
            StoreError::InviteCodeExhausted => ServerError::Internal(err.to_string()),
            StoreError::Sqlite(_)
            | StoreError::Io(_)
            | StoreError::Migration(_)
            | StoreError::ChronoParse(_) => ServerError::Persistence(err.to_string()),
        }
    }
}

impl From<TokenError> for ServerError {
    fn from(err: TokenError) -> Self {
        tracing::debug!(error = %err, "token rejected");
        ServerError::AuthInvalid
    }
}

impl From<FrameError> for ServerError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Serialization(e) => ServerError::Internal(e.to_string()),
            other => ServerError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.public_message(),
        });

        (status, axum::Json(body)).into_response()
    }
}

//! The socket seam under a [`Session`](crate::session::Session).
//!
//! The session only speaks text frames and close codes. The websocket
//! adapter maps those onto axum's `WebSocket`; tests use an in-memory pair.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A bidirectional text-frame connection to one client.
#[async_trait]
pub trait Transport: Send {
    /// Complete the handshake.
    async fn accept(&mut self) -> Result<(), TransportError>;

    /// Next inbound text frame. `Ok(None)` once the client has gone away.
    async fn receive(&mut self) -> Result<Option<String>, TransportError>;

    async fn send(&mut self, text: &str) -> Result<(), TransportError>;

    /// Close with the given websocket close code.
    async fn close(&mut self, code: u16) -> Result<(), TransportError>;
}

// ---------------------------------------------------------------------------
// axum websocket adapter
// ---------------------------------------------------------------------------

pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn accept(&mut self) -> Result<(), TransportError> {
        // axum finished the upgrade before handing us the socket.
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.socket.recv().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes.to_vec())
                        .map(Some)
                        .map_err(|_| TransportError::Protocol("binary frame is not UTF-8".into()));
                }
                // axum answers pings itself.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Err(e)) => return Err(TransportError::Protocol(e.to_string())),
            }
        }
    }

    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, code: u16) -> Result<(), TransportError> {
        self.socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: "".into(),
            })))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

// ---------------------------------------------------------------------------
// In-memory pair for tests
// ---------------------------------------------------------------------------

//! Connection Session: one client socket bound to one (user, room).
//!
//! ```text
//! Connecting -> Validating -> Accepted -> Streaming -> Closing -> Closed
//!                    |
//!                    +-> Closed (rejected with 1008, no data frames)
//! ```
//!
//! A session validates the token and membership, registers presence,
//! announces the join, replays recent history, then relays inbound text to
//! the [`Broadcaster`] and outbound frames from its presence queue to the
//! socket until either side goes away.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use agora_shared::constants::{CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};
use agora_shared::protocol::{parse_client_text, ChatFrame, ServerFrame};
use agora_shared::token::TokenService;
use agora_shared::types::{RoomId, UserId};

use crate::broadcast::Broadcaster;
use crate::presence::{ConnectionId, Outbound, OutboundRx, PresenceRegistry};
use crate::store::Store;
use crate::transport::Transport;

/// Everything a session needs from the rest of the server.
#[derive(Clone)]
pub struct SessionContext {
    pub store: Store,
    pub presence: PresenceRegistry,
    pub broadcaster: Broadcaster,
    pub tokens: Arc<TokenService>,
    pub history_limit: u32,
    pub outbound_buffer: usize,
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Validating,
    Accepted,
    Streaming,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Missing, malformed, expired, or issued to another user
    InvalidToken,
    NotAMember,
    AccountInactive,
    /// Membership could not be checked
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    /// Another connection for the same user took over
    Superseded,
    IdleTimeout,
    TransportFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Rejected(RejectReason),
    Closed(CloseReason),
}

pub struct Session<T> {
    ctx: SessionContext,
    transport: T,
    room_id: RoomId,
    user_id: UserId,
    conn_id: ConnectionId,
    state: SessionState,
}

impl<T: Transport> Session<T> {
    pub fn new(ctx: SessionContext, transport: T, room_id: RoomId, user_id: UserId) -> Self {
        let conn_id = ctx.presence.next_connection_id();
        Self {
            ctx,
            transport,
            room_id,
            user_id,
            conn_id,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the connection to completion.
    pub async fn run(mut self, token: Option<&str>) -> SessionOutcome {
        self.state = SessionState::Validating;
        let username = match self.validate(token).await {
            Ok(username) => username,
            Err(reason) => return self.reject(reason).await,
        };

        self.state = SessionState::Accepted;
        if let Err(e) = self.transport.accept().await {
            warn!(conn = %self.conn_id, error = %e, "handshake failed");
            self.state = SessionState::Closed;
            return SessionOutcome::Closed(CloseReason::TransportFailed);
        }
        info!(
            room = %self.room_id,
            user = %self.user_id,
            conn = %self.conn_id,
            "connection accepted"
        );

        let (tx, rx) = mpsc::channel(self.ctx.outbound_buffer);
        self.ctx
            .presence
            .register(self.user_id, self.conn_id, self.room_id, tx);

        if let Err(e) = self
            .ctx
            .broadcaster
            .announce(self.room_id, ServerFrame::joined(self.room_id, &username))
            .await
        {
            warn!(room = %self.room_id, error = %e, "join announcement failed");
        }

        let reason = match self.replay_history().await {
            Ok(last_replayed) => {
                self.state = SessionState::Streaming;
                self.stream(rx, last_replayed).await
            }
            Err(reason) => reason,
        };

        self.finish(reason, &username).await
    }

    // ------------------------------------------------------------------
    // Validating
    // ------------------------------------------------------------------

    async fn validate(&mut self, token: Option<&str>) -> Result<String, RejectReason> {
        let token = token.ok_or(RejectReason::InvalidToken)?;
        self.ctx
            .tokens
            .verify_for(token, self.user_id)
            .map_err(|e| {
                debug!(user = %self.user_id, error = %e, "token rejected");
                RejectReason::InvalidToken
            })?;

        let (room_id, user_id) = (self.room_id, self.user_id);
        let found = self
            .ctx
            .store
            .call(move |db| {
                if !db.is_member(user_id, room_id)? {
                    return Ok(None);
                }
                db.get_user(user_id).map(Some)
            })
            .await
            .map_err(|e| {
                warn!(room = %room_id, user = %user_id, error = %e, "membership check failed");
                RejectReason::Unavailable
            })?;

        match found {
            None => Err(RejectReason::NotAMember),
            Some(user) if !user.is_active => Err(RejectReason::AccountInactive),
            Some(user) => Ok(user.username),
        }
    }

    async fn reject(mut self, reason: RejectReason) -> SessionOutcome {
        warn!(
            room = %self.room_id,
            user = %self.user_id,
            reason = ?reason,
            "connection rejected"
        );
        let _ = self.transport.close(CLOSE_POLICY_VIOLATION).await;
        self.state = SessionState::Closed;
        SessionOutcome::Rejected(reason)
    }

    // ------------------------------------------------------------------
    // Accepted
    // ------------------------------------------------------------------

    /// Send the most recent messages, oldest first. Returns the id of the
    /// last one sent.
    async fn replay_history(&mut self) -> Result<Option<i64>, CloseReason> {
        let (room_id, limit) = (self.room_id, self.ctx.history_limit);
        let history = match self
            .ctx
            .store
            .call(move |db| db.recent_messages(room_id, limit))
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(room = %room_id, error = %e, "history replay failed");
                self.send_frame(&ServerFrame::error("History unavailable"))
                    .await?;
                return Ok(None);
            }
        };

        let mut last = None;
        for message in history {
            last = Some(message.id);
            let frame = ServerFrame::Message(ChatFrame {
                id: message.id,
                room_id,
                user_id: message.user_id,
                username: message.username,
                message: message.content,
                sent_at: message.created_at,
            });
            self.send_frame(&frame).await?;
        }
        Ok(last)
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    async fn stream(&mut self, mut rx: OutboundRx, last_replayed: Option<i64>) -> CloseReason {
        let idle_timeout = self.ctx.idle_timeout;
        let mut deadline = idle_timeout.map(|d| Instant::now() + d);

        loop {
            tokio::select! {
                inbound = self.transport.receive() => match inbound {
                    Ok(Some(text)) => {
                        deadline = idle_timeout.map(|d| Instant::now() + d);
                        if let Err(reason) = self.handle_inbound(&text).await {
                            return reason;
                        }
                    }
                    Ok(None) => return CloseReason::ClientDisconnected,
                    Err(e) => {
                        debug!(conn = %self.conn_id, error = %e, "inbound failed");
                        return CloseReason::TransportFailed;
                    }
                },
                outbound = rx.recv() => match outbound {
                    Some(outbound) => {
                        if already_replayed(&outbound, self.room_id, last_replayed) {
                            debug!(conn = %self.conn_id, message = ?outbound.message_id, "skipping replayed message");
                            continue;
                        }
                        if self.transport.send(&outbound.payload).await.is_err() {
                            return CloseReason::TransportFailed;
                        }
                    }
                    // The registry dropped our sender: a newer connection
                    // replaced this one.
                    None => return CloseReason::Superseded,
                },
                _ = idle_expired(deadline) => return CloseReason::IdleTimeout,
            }
        }
    }

    async fn handle_inbound(&mut self, text: &str) -> Result<(), CloseReason> {
        let content = parse_client_text(text);
        match self
            .ctx
            .broadcaster
            .broadcast(self.room_id, self.user_id, content)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    room = %self.room_id,
                    user = %self.user_id,
                    error = %e,
                    "message rejected"
                );
                self.send_frame(&ServerFrame::error(e.public_message()))
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    async fn finish(mut self, reason: CloseReason, username: &str) -> SessionOutcome {
        self.state = SessionState::Closing;
        self.ctx.presence.release(self.user_id, self.conn_id);

        // A user superseded on this same room is still present in it
        // through the newer connection.
        let still_here = reason == CloseReason::Superseded
            && self.ctx.presence.current_room(self.user_id) == Some(self.room_id);
        if !still_here {
            if let Err(e) = self
                .ctx
                .broadcaster
                .announce(self.room_id, ServerFrame::left(self.room_id, username))
                .await
            {
                debug!(room = %self.room_id, error = %e, "leave announcement failed");
            }
        }

        let _ = self.transport.close(CLOSE_NORMAL).await;
        self.state = SessionState::Closed;
        info!(
            room = %self.room_id,
            user = %self.user_id,
            conn = %self.conn_id,
            reason = ?reason,
            "connection closed"
        );
        SessionOutcome::Closed(reason)
    }

    async fn send_frame(&mut self, frame: &ServerFrame) -> Result<(), CloseReason> {
        let text = match frame.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "frame serialization failed");
                return Ok(());
            }
        };
        self.transport
            .send(&text)
            .await
            .map_err(|_| CloseReason::TransportFailed)
    }
}

/// `true` for a live chat frame the history replay already delivered.
///
/// Replay only covers the session's own room, so frames fanned out for the
/// user's other rooms always pass.
fn already_replayed(outbound: &Outbound, room_id: RoomId, last_replayed: Option<i64>) -> bool {
    outbound.room_id == room_id
        && matches!((outbound.message_id, last_replayed), (Some(id), Some(last)) if id <= last)
}

async fn idle_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

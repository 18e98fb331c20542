//! Presence Registry: which users are online, and how to reach them.
//!
//! At most one live connection per user. Registering again replaces the
//! previous entry and drops its outbound sender, which the superseded
//! session observes as its outbound channel closing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

use agora_shared::error::FrameError;
use agora_shared::protocol::ServerFrame;
use agora_shared::types::{RoomId, UserId};

/// A serialized frame queued for one connection.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Room the frame was fanned out for
    pub room_id: RoomId,
    /// Message Log id for chat frames, used to skip history duplicates
    pub message_id: Option<i64>,
    pub payload: Arc<str>,
}

impl Outbound {
    pub fn new(room_id: RoomId, frame: &ServerFrame) -> Result<Self, FrameError> {
        Ok(Self {
            room_id,
            message_id: frame.message_id(),
            payload: Arc::from(frame.to_json()?),
        })
    }
}

pub type OutboundTx = mpsc::Sender<Outbound>;
pub type OutboundRx = mpsc::Receiver<Outbound>;

/// Identifies one physical connection, so a stale session cannot remove the
/// entry of the session that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct Presence {
    conn_id: ConnectionId,
    /// Room the connection was opened for
    room_id: RoomId,
    sender: OutboundTx,
}

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    entries: Arc<RwLock<HashMap<UserId, Presence>>>,
    next_id: Arc<AtomicU64>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register `sender` as the live connection for `user_id`, opened on
    /// `room_id`.
    ///
    /// Returns the id of the connection it replaced, if any.
    pub fn register(
        &self,
        user_id: UserId,
        conn_id: ConnectionId,
        room_id: RoomId,
        sender: OutboundTx,
    ) -> Option<ConnectionId> {
        let displaced = self.entries.write().insert(
            user_id,
            Presence {
                conn_id,
                room_id,
                sender,
            },
        );

        match displaced {
            Some(old) => {
                info!(
                    user = %user_id,
                    old = %old.conn_id,
                    new = %conn_id,
                    old_room = %old.room_id,
                    new_room = %room_id,
                    "presence replaced"
                );
                Some(old.conn_id)
            }
            None => {
                debug!(user = %user_id, conn = %conn_id, "presence registered");
                None
            }
        }
    }

    /// Remove whatever entry `user_id` has. Idempotent.
    pub fn unregister(&self, user_id: UserId) {
        if self.entries.write().remove(&user_id).is_some() {
            debug!(user = %user_id, "presence unregistered");
        }
    }

    /// Remove the entry for `user_id` only if it still belongs to `conn_id`.
    ///
    /// Returns `false` when a newer connection owns the entry.
    pub fn release(&self, user_id: UserId, conn_id: ConnectionId) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&user_id) {
            Some(presence) if presence.conn_id == conn_id => {
                entries.remove(&user_id);
                debug!(user = %user_id, conn = %conn_id, "presence released");
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, user_id: UserId) -> Option<OutboundTx> {
        self.entries
            .read()
            .get(&user_id)
            .map(|presence| presence.sender.clone())
    }

    /// Room the user's live connection was opened on.
    pub fn current_room(&self, user_id: UserId) -> Option<RoomId> {
        self.entries.read().get(&user_id).map(|presence| presence.room_id)
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.entries.read().contains_key(&user_id)
    }

    pub fn online_count(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = PresenceRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let conn = registry.next_connection_id();

        assert!(registry.register(UserId(1), conn, RoomId(1), tx).is_none());
        assert!(registry.lookup(UserId(1)).is_some());
        assert!(registry.lookup(UserId(2)).is_none());
        assert_eq!(registry.online_count(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = PresenceRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register(UserId(1), registry.next_connection_id(), RoomId(1), tx);

        registry.unregister(UserId(1));
        registry.unregister(UserId(1));
        registry.unregister(UserId(99));

        assert!(registry.lookup(UserId(1)).is_none());
        assert_eq!(registry.online_count(), 0);
    }

    #[tokio::test]
    async fn test_replacement_closes_previous_channel() {
        let registry = PresenceRegistry::new();
        let (old_tx, mut old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);
        let old_conn = registry.next_connection_id();
        let new_conn = registry.next_connection_id();

        registry.register(UserId(1), old_conn, RoomId(1), old_tx);
        assert_eq!(registry.register(UserId(1), new_conn, RoomId(2), new_tx), Some(old_conn));

        // The registry held the only sender for the old connection.
        assert!(old_rx.recv().await.is_none());
        assert_eq!(registry.online_count(), 1);
        assert_eq!(registry.current_room(UserId(1)), Some(RoomId(2)));
    }

    #[test]
    fn test_release_ignores_stale_connection() {
        let registry = PresenceRegistry::new();
        let (old_tx, _old_rx) = mpsc::channel(4);
        let (new_tx, _new_rx) = mpsc::channel(4);
        let old_conn = registry.next_connection_id();
        let new_conn = registry.next_connection_id();

        registry.register(UserId(1), old_conn, RoomId(1), old_tx);
        registry.register(UserId(1), new_conn, RoomId(2), new_tx);

        assert!(!registry.release(UserId(1), old_conn));
        assert!(registry.is_online(UserId(1)));
        assert!(registry.release(UserId(1), new_conn));
        assert!(!registry.is_online(UserId(1)));
    }
}

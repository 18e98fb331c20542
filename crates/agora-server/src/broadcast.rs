//! Room Broadcaster: persist a message, then fan it out to every online
//! member of the room.
//!
//! Delivery is best effort per recipient. A full or closed outbound queue
//! drops that recipient's copy with a warning; the message stays in the
//! log and the other members still get it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use agora_shared::protocol::{ChatFrame, ServerFrame};
use agora_shared::types::{RoomId, UserId};
use agora_store::Message;

use crate::error::ServerError;
use crate::presence::{Outbound, PresenceRegistry};
use crate::store::Store;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Recipients whose queue accepted the frame
    pub delivered: usize,
    /// Members with no live connection
    pub offline: usize,
    /// Members whose queue was full or closed
    pub failed: usize,
}

/// The result of a successful [`Broadcaster::broadcast`].
#[derive(Debug, Clone)]
pub struct Broadcasted {
    pub message: Message,
    pub report: DeliveryReport,
}

#[derive(Clone)]
pub struct Broadcaster {
    store: Store,
    presence: PresenceRegistry,
    sequencer: RoomSequencer,
    max_message_len: usize,
}

impl Broadcaster {
    pub fn new(store: Store, presence: PresenceRegistry, max_message_len: usize) -> Self {
        Self {
            store,
            presence,
            sequencer: RoomSequencer::default(),
            max_message_len,
        }
    }

    /// Append `content` to the room's log as `sender`, then deliver it to
    /// every online member, the sender included.
    ///
    /// Fails only if the append fails; nothing is delivered in that case.
    pub async fn broadcast(
        &self,
        room_id: RoomId,
        sender: UserId,
        content: String,
    ) -> Result<Broadcasted, ServerError> {
        let max_len = self.max_message_len;
        let _turn = self.sequencer.lock(room_id).await;

        let message = self
            .store
            .call(move |db| db.append_message(room_id, sender, &content, max_len))
            .await?;

        let frame = ServerFrame::Message(ChatFrame {
            id: message.id,
            room_id,
            user_id: message.user_id,
            username: message.username.clone(),
            message: message.content.clone(),
            sent_at: message.created_at,
        });

        // The message is durable from here on; a fan-out problem must not
        // turn into an error for the sender.
        let report = match self.fan_out(room_id, &frame).await {
            Ok(report) => report,
            Err(e) => {
                warn!(room = %room_id, message = message.id, error = %e, "fan-out skipped");
                DeliveryReport::default()
            }
        };

        debug!(
            room = %room_id,
            message = message.id,
            delivered = report.delivered,
            offline = report.offline,
            failed = report.failed,
            "message broadcast"
        );

        Ok(Broadcasted { message, report })
    }

    /// Deliver a non-persisted frame (join / leave / expel notices) to every
    /// online member of the room.
    pub async fn announce(
        &self,
        room_id: RoomId,
        frame: ServerFrame,
    ) -> Result<DeliveryReport, ServerError> {
        let _turn = self.sequencer.lock(room_id).await;
        self.fan_out(room_id, &frame).await
    }

    async fn fan_out(
        &self,
        room_id: RoomId,
        frame: &ServerFrame,
    ) -> Result<DeliveryReport, ServerError> {
        let members = self.store.call(move |db| db.list_members(room_id)).await?;
        let outbound = Outbound::new(room_id, frame)?;

        let mut report = DeliveryReport::default();
        for member in members {
            let Some(sender) = self.presence.lookup(member.user_id) else {
                report.offline += 1;
                continue;
            };
            match sender.try_send(outbound.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(room = %room_id, user = %member.user_id, "outbound queue full, frame dropped");
                    report.failed += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(room = %room_id, user = %member.user_id, "outbound queue closed, frame dropped");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Per-room ordering
// ---------------------------------------------------------------------------

/// Serialises append + fan-out per room so every recipient sees a room's
/// frames in log order. Rooms never wait on each other.
#[derive(Clone, Default)]
struct RoomSequencer {
    rooms: Arc<Mutex<HashMap<RoomId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RoomSequencer {
    async fn lock(&self, room_id: RoomId) -> RoomTurn {
        let slot = self.rooms.lock().entry(room_id).or_default().clone();
        let guard = slot.clone().lock_owned().await;
        RoomTurn {
            rooms: self.rooms.clone(),
            room_id,
            slot,
            guard: Some(guard),
        }
    }
}

struct RoomTurn {
    rooms: Arc<Mutex<HashMap<RoomId, Arc<tokio::sync::Mutex<()>>>>>,
    room_id: RoomId,
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for RoomTurn {
    fn drop(&mut self) {
        self.guard.take();
        // Slots are only cloned under the map lock, so two strong refs (the
        // map's and ours) means nobody else is queued on this room.
        let mut rooms = self.rooms.lock();
        if Arc::strong_count(&self.slot) == 2 {
            rooms.remove(&self.room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_store::{Database, NewRoom};
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        presence: PresenceRegistry,
        broadcaster: Broadcaster,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(Database::open_at(&dir.path().join("agora.db")).unwrap());
        let presence = PresenceRegistry::new();
        let broadcaster = Broadcaster::new(store.clone(), presence.clone(), 4096);
        Fixture {
            _dir: dir,
            store,
            presence,
            broadcaster,
        }
    }

    /// alice manages a public room that bob and carol have joined.
    async fn seed(store: &Store) -> (RoomId, UserId, UserId, UserId) {
        store
            .call(|db| {
                let alice = db.create_user("alice", "opaque-hash")?;
                let bob = db.create_user("bob", "opaque-hash")?;
                let carol = db.create_user("carol", "opaque-hash")?;
                let room = db.create_room(&NewRoom {
                    manager_id: alice.id,
                    name: "lobby".into(),
                    is_private: false,
                    category_id: None,
                })?;
                db.join_room(bob.id, room.id, None)?;
                db.join_room(carol.id, room.id, None)?;
                Ok((room.id, alice.id, bob.id, carol.id))
            })
            .await
            .unwrap()
    }

    fn connect(
        presence: &PresenceRegistry,
        user: UserId,
        room: RoomId,
        buffer: usize,
    ) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(buffer);
        presence.register(user, presence.next_connection_id(), room, tx);
        rx
    }

    fn decode(outbound: &Outbound) -> ServerFrame {
        serde_json::from_str(&outbound.payload).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_online_members_including_sender() {
        let f = fixture();
        let (room, alice, bob, _carol) = seed(&f.store).await;
        let mut alice_rx = connect(&f.presence, alice, room, 8);
        let mut bob_rx = connect(&f.presence, bob, room, 8);

        let sent = f
            .broadcaster
            .broadcast(room, alice, "hello".to_string())
            .await
            .unwrap();

        assert_eq!(
            sent.report,
            DeliveryReport {
                delivered: 2,
                offline: 1,
                failed: 0
            }
        );

        for rx in [&mut alice_rx, &mut bob_rx] {
            let outbound = rx.recv().await.unwrap();
            assert_eq!(outbound.message_id, Some(sent.message.id));
            match decode(&outbound) {
                ServerFrame::Message(chat) => {
                    assert_eq!(chat.user_id, alice);
                    assert_eq!(chat.username, "alice");
                    assert_eq!(chat.message, "hello");
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        // carol was offline but the message is in the log.
        let history = f.store.call(move |db| db.recent_messages(room, 10)).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_others() {
        let f = fixture();
        let (room, alice, bob, carol) = seed(&f.store).await;
        let _alice_rx = connect(&f.presence, alice, room, 8);
        let _bob_rx = connect(&f.presence, bob, room, 1);
        let mut carol_rx = connect(&f.presence, carol, room, 8);

        f.broadcaster.broadcast(room, alice, "one".into()).await.unwrap();
        let second = f.broadcaster.broadcast(room, alice, "two".into()).await.unwrap();

        assert_eq!(second.report.failed, 1);
        assert_eq!(second.report.delivered, 2);

        let texts: Vec<String> = [carol_rx.recv().await.unwrap(), carol_rx.recv().await.unwrap()]
            .iter()
            .map(|o| match decode(o) {
                ServerFrame::Message(chat) => chat.message,
                other => panic!("unexpected frame: {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_failed_append_delivers_nothing() {
        let f = fixture();
        let (room, alice, bob, _carol) = seed(&f.store).await;
        let mut bob_rx = connect(&f.presence, bob, room, 8);

        let err = f
            .broadcaster
            .broadcast(room, alice, "   ".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));

        let outsider = f
            .store
            .call(|db| db.create_user("mallory", "opaque-hash"))
            .await
            .unwrap();
        let err = f
            .broadcaster
            .broadcast(room, outsider.id, "hi".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotAMember));

        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_announce_is_not_persisted() {
        let f = fixture();
        let (room, _alice, bob, _carol) = seed(&f.store).await;
        let mut bob_rx = connect(&f.presence, bob, room, 8);

        let report = f
            .broadcaster
            .announce(room, ServerFrame::joined(room, "alice"))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);

        let outbound = bob_rx.recv().await.unwrap();
        assert_eq!(outbound.message_id, None);
        assert_eq!(decode(&outbound), ServerFrame::joined(room, "alice"));

        let history = f.store.call(move |db| db.recent_messages(room, 10)).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_delivered_in_log_order() {
        let f = fixture();
        let (room, alice, bob, carol) = seed(&f.store).await;
        let members = [alice, bob, carol];
        let mut receivers: Vec<_> = members
            .iter()
            .map(|&user| connect(&f.presence, user, room, 256))
            .collect();

        let senders: Vec<_> = members
            .iter()
            .map(|&user| {
                let broadcaster = f.broadcaster.clone();
                tokio::spawn(async move {
                    for i in 0..20 {
                        broadcaster
                            .broadcast(room, user, format!("{user} says {i}"))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.await.unwrap();
        }

        let logged: Vec<i64> = f
            .store
            .call(move |db| db.recent_messages(room, 100))
            .await
            .unwrap()
            .iter()
            .map(|message| message.id)
            .collect();
        assert_eq!(logged.len(), 60);

        for rx in &mut receivers {
            let mut seen = Vec::new();
            while let Ok(outbound) = rx.try_recv() {
                seen.push(outbound.message_id.unwrap());
            }
            assert_eq!(seen, logged);
        }
    }

    #[tokio::test]
    async fn test_sequencer_forgets_idle_rooms() {
        let sequencer = RoomSequencer::default();
        {
            let _turn = sequencer.lock(RoomId(1)).await;
            assert_eq!(sequencer.rooms.lock().len(), 1);
        }
        assert!(sequencer.rooms.lock().is_empty());
    }
}

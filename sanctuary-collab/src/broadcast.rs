//! Per-session fan-out for the relay.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to `capacity`
//! frames; a receiver that falls further behind loses the oldest frames.
//! Frames carry their origin connection so each receiver can skip its own echo.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Collaborator, CollaboratorPatch, ProtocolError, ServerEvent};

/// An encoded server event tagged with the connection it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayFrame {
    pub origin: Uuid,
    pub payload: String,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters for the send path.
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// The fan-out group for one session.
///
/// Peers are keyed by connection id, not user id: the same user may hold
/// several connections.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RelayFrame>>,
    peers: Arc<RwLock<HashMap<Uuid, Collaborator>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a connection and return its receiver.
    pub async fn add_peer(
        &self,
        connection_id: Uuid,
        collaborator: Collaborator,
    ) -> broadcast::Receiver<Arc<RelayFrame>> {
        let mut peers = self.peers.write().await;
        peers.insert(connection_id, collaborator);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, connection_id: &Uuid) -> Option<Collaborator> {
        self.peers.write().await.remove(connection_id)
    }

    /// Patch the stored record for a connection, so later joiners see current flags.
    pub async fn update_peer(
        &self,
        connection_id: &Uuid,
        patch: &CollaboratorPatch,
    ) -> Option<Collaborator> {
        let mut peers = self.peers.write().await;
        let slot = peers.get_mut(connection_id)?;
        *slot = patch.apply(slot);
        Some(slot.clone())
    }

    /// Encode and send `event` to every receiver, including the origin's.
    ///
    /// Returns the number of receivers. Filtering the echo is the receiver's job.
    pub fn broadcast(&self, origin: Uuid, event: &ServerEvent) -> Result<usize, ProtocolError> {
        let payload = event.encode()?;
        Ok(self.broadcast_raw(Arc::new(RelayFrame { origin, payload })))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, frame: Arc<RelayFrame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Current records of every connected peer.
    pub async fn peers(&self) -> Vec<(Uuid, Collaborator)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, c)| (*id, c.clone()))
            .collect()
    }

    pub async fn has_peer(&self, connection_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.atomic_stats.frames_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A connection registered in a session group by [`RoomManager::join`].
pub struct RoomJoin {
    pub group: Arc<BroadcastGroup>,
    pub receiver: broadcast::Receiver<Arc<RelayFrame>>,
    /// Peers already in the group, ordered by id
    pub roster: Vec<Collaborator>,
}

/// The session already holds its maximum number of connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomFull {
    pub peers: usize,
}

/// Maps session ids to broadcast groups.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, session_id: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(session_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(session_id) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(session_id.to_string(), room.clone());
        room
    }

    /// Find or create the session's group and register a connection in it.
    ///
    /// Runs under the rooms write lock, so it cannot interleave with
    /// [`Self::remove_if_empty`] and concurrent joins cannot overshoot
    /// `max_peers`. A refused join never creates a group.
    pub async fn join(
        &self,
        session_id: &str,
        connection_id: Uuid,
        collaborator: Collaborator,
        max_peers: usize,
    ) -> Result<RoomJoin, RoomFull> {
        let mut rooms = self.rooms.write().await;
        let group = match rooms.get(session_id) {
            Some(group) => group.clone(),
            None if max_peers == 0 => return Err(RoomFull { peers: 0 }),
            None => {
                let group = Arc::new(BroadcastGroup::new(self.default_capacity));
                rooms.insert(session_id.to_string(), group.clone());
                group
            }
        };

        let mut peers = group.peers.write().await;
        if peers.len() >= max_peers {
            return Err(RoomFull { peers: peers.len() });
        }
        let mut roster: Vec<Collaborator> = peers.values().cloned().collect();
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        peers.insert(connection_id, collaborator);
        let receiver = group.sender.subscribe();
        drop(peers);

        Ok(RoomJoin { group, receiver, roster })
    }

    /// Drop the session's group if nobody is left in it.
    pub async fn remove_if_empty(&self, session_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(session_id) {
            if room.peer_count().await == 0 {
                rooms.remove(session_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();

        let _rx = group.add_peer(conn, Collaborator::new("a", "Alice")).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&conn).await);

        let removed = group.remove_peer(&conn).await.unwrap();
        assert_eq!(removed.id, "a");
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_includes_origin() {
        let group = BroadcastGroup::new(16);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let mut rx_alice = group.add_peer(alice, Collaborator::new("a", "Alice")).await;
        let mut rx_bob = group.add_peer(bob, Collaborator::new("b", "Bob")).await;

        let event = ServerEvent::CollaboratorLeft("z".into());
        assert_eq!(group.broadcast(alice, &event).unwrap(), 2);

        let frame = rx_bob.recv().await.unwrap();
        assert_eq!(frame.origin, alice);
        assert_eq!(ServerEvent::decode(&frame.payload).unwrap(), event);
        // origin also receives it; skipping is up to the connection task
        assert_eq!(rx_alice.recv().await.unwrap().origin, alice);
    }

    #[tokio::test]
    async fn test_update_peer_patches_record() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();
        let _rx = group.add_peer(conn, Collaborator::new("a", "Alice")).await;

        let updated = group.update_peer(&conn, &CollaboratorPatch::video(true)).await.unwrap();
        assert!(updated.has_video);
        assert!(group.peers().await[0].1.has_video);
        assert!(group.update_peer(&Uuid::new_v4(), &CollaboratorPatch::mic(true)).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();
        let _rx = group.add_peer(conn, Collaborator::new("a", "Alice")).await;

        let event = ServerEvent::CollaboratorLeft("x".into());
        group.broadcast(conn, &event).unwrap();
        group.broadcast(conn, &event).unwrap();
        group.record_dropped(3);

        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.frames_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let conn = Uuid::new_v4();
        let mut rx = group.add_peer(conn, Collaborator::new("a", "Alice")).await;

        for i in 0..5 {
            group.broadcast(conn, &ServerEvent::CollaboratorLeft(i.to_string())).unwrap();
        }
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(3))));
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::new(16);
        let room1 = manager.get_or_create("s-1").await;
        let room2 = manager.get_or_create("s-1").await;
        assert!(Arc::ptr_eq(&room1, &room2));

        let _room3 = manager.get_or_create("s-2").await;
        assert_eq!(manager.room_count().await, 2);
        let sessions = manager.active_sessions().await;
        assert!(sessions.contains(&"s-1".to_string()));
        assert_eq!(room1.capacity(), 16);
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let room = manager.get_or_create("s-1").await;
        let conn = Uuid::new_v4();
        let _rx = room.add_peer(conn, Collaborator::new("a", "Alice")).await;

        assert!(!manager.remove_if_empty("s-1").await);
        room.remove_peer(&conn).await;
        assert!(manager.remove_if_empty("s-1").await);
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_survives_last_peer_leaving() {
        let manager = RoomManager::new(16);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let first = manager.join("s", a, Collaborator::new("a", "Alice"), 10).await.unwrap();
        let second = manager.join("s", b, Collaborator::new("b", "Bob"), 10).await.unwrap();
        assert_eq!(second.roster, vec![Collaborator::new("a", "Alice")]);

        // Alice's cleanup runs while Bob is still replaying the roster
        first.group.remove_peer(&a).await;
        assert!(!manager.remove_if_empty("s").await);

        let third = manager.join("s", c, Collaborator::new("c", "Cleo"), 10).await.unwrap();
        assert!(Arc::ptr_eq(&second.group, &third.group));
        assert_eq!(third.roster, vec![Collaborator::new("b", "Bob")]);
        assert_eq!(third.group.peer_count().await, 2);
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_respect_capacity() {
        let manager = Arc::new(RoomManager::new(16));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .join("s", Uuid::new_v4(), Collaborator::new(format!("u{i}"), "U"), 1)
                    .await
                    .is_ok()
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(manager.get_or_create("s").await.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_refused_join_creates_no_room() {
        let manager = RoomManager::new(16);
        let refused = manager.join("s", Uuid::new_v4(), Collaborator::new("a", "Alice"), 0).await;
        assert_eq!(refused.err(), Some(RoomFull { peers: 0 }));
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_receiver_gets_later_frames() {
        let manager = RoomManager::new(16);
        let a = Uuid::new_v4();
        let mut joined = manager.join("s", a, Collaborator::new("a", "Alice"), 10).await.unwrap();
        assert!(joined.roster.is_empty());

        let event = ServerEvent::CollaboratorLeft("z".into());
        joined.group.broadcast(Uuid::new_v4(), &event).unwrap();
        let frame = joined.receiver.recv().await.unwrap();
        assert_eq!(ServerEvent::decode(&frame.payload).unwrap(), event);
    }
}

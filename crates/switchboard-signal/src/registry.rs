//! Peer registry and room index
//!
//! Plain single-threaded bookkeeping. Nothing here is synchronized; all
//! access goes through [`crate::hub::Hub`], which keeps the two maps
//! consistent with each other inside one critical section.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::time::Instant;

use switchboard_core::PeerId;

use crate::messages::PeerSummary;
use crate::transport::FrameSink;

/// A registered connection
pub struct PeerRecord {
    /// Unique peer identifier
    pub peer_id: PeerId,
    /// Display name, empty until set by a join
    pub name: String,
    /// Current room, if any
    pub room: Option<String>,
    /// Last valid inbound frame (or session start)
    pub last_seen: Instant,
    /// Outbound half of the transport; the session owns the strong reference
    sink: Weak<dyn FrameSink>,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId, sink: &Arc<dyn FrameSink>) -> Self {
        Self {
            peer_id,
            name: String::new(),
            room: None,
            last_seen: Instant::now(),
            sink: Arc::downgrade(sink),
        }
    }

    /// Transport handle, if the owning session still holds it
    pub fn sink(&self) -> Option<Arc<dyn FrameSink>> {
        self.sink.upgrade()
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.peer_id.clone(),
            name: self.name.clone(),
        }
    }
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecord")
            .field("peer_id", &self.peer_id)
            .field("name", &self.name)
            .field("room", &self.room)
            .field("last_seen", &self.last_seen)
            .finish_non_exhaustive()
    }
}

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("peer {0} is already registered")]
    DuplicatePeer(PeerId),
}

/// Peers by id and room membership by room name
#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<PeerId, PeerRecord>,
    rooms: HashMap<String, BTreeSet<PeerId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new peer; fails if the id is taken
    pub fn register(&mut self, peer: PeerRecord) -> Result<(), RegistryError> {
        if self.peers.contains_key(&peer.peer_id) {
            return Err(RegistryError::DuplicatePeer(peer.peer_id));
        }
        self.peers.insert(peer.peer_id.clone(), peer);
        Ok(())
    }

    pub fn lookup(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn lookup_mut(&mut self, peer_id: &str) -> Option<&mut PeerRecord> {
        self.peers.get_mut(peer_id)
    }

    /// Remove and return a peer. Room membership is left to the caller.
    pub fn remove(&mut self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.remove(peer_id)
    }

    /// Add a peer to a room, creating the room if needed
    pub fn join_room(&mut self, room: &str, peer_id: &PeerId) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(peer_id.clone());
    }

    /// Remove a peer from a room, deleting the room once empty.
    /// Returns true if the peer was a member.
    pub fn leave_room(&mut self, room: &str, peer_id: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(peer_id);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    /// Snapshot of a room's members; empty for unknown rooms
    pub fn room_members(&self, room: &str) -> BTreeSet<PeerId> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Verify the peer/room cross-references agree
    pub fn check_consistency(&self) -> Result<(), String> {
        for (room, members) in &self.rooms {
            if members.is_empty() {
                return Err(format!("room {} is empty", room));
            }
            for id in members {
                match self.peers.get(id) {
                    None => return Err(format!("room {} lists unregistered peer {}", room, id)),
                    Some(peer) if peer.room.as_deref() != Some(room.as_str()) => {
                        return Err(format!(
                            "room {} lists peer {} whose room is {:?}",
                            room, id, peer.room
                        ))
                    }
                    Some(_) => {}
                }
            }
        }

        for (id, peer) in &self.peers {
            if let Some(room) = &peer.room {
                if !self.rooms.get(room).is_some_and(|m| m.contains(id)) {
                    return Err(format!("peer {} claims room {} but is not a member", id, room));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel;

    fn make_peer(id: &str) -> (PeerRecord, Arc<dyn FrameSink>) {
        let (sink, _source, _client) = channel();
        let sink: Arc<dyn FrameSink> = Arc::new(sink);
        (PeerRecord::new(PeerId::from(id), &sink), sink)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let mut registry = Registry::new();
        let (peer, _sink) = make_peer("a");
        registry.register(peer).unwrap();

        assert_eq!(registry.peer_count(), 1);
        assert!(registry.lookup("a").is_some());
        assert!(registry.lookup("b").is_none());

        let (dup, _sink2) = make_peer("a");
        assert_eq!(
            registry.register(dup).unwrap_err(),
            RegistryError::DuplicatePeer(PeerId::from("a"))
        );
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let mut registry = Registry::new();
        let (peer, _sink) = make_peer("a");
        registry.register(peer).unwrap();

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert_eq!(registry.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_room_pruning() {
        let mut registry = Registry::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");

        registry.join_room("r1", &a);
        registry.join_room("r1", &b);
        assert_eq!(registry.room_members("r1").len(), 2);
        assert_eq!(registry.room_count(), 1);

        assert!(registry.leave_room("r1", "a"));
        assert_eq!(registry.room_count(), 1);
        assert!(registry.leave_room("r1", "b"));
        assert_eq!(registry.room_count(), 0);

        assert!(!registry.leave_room("r1", "b"));
        assert!(registry.room_members("r1").is_empty());
    }

    #[tokio::test]
    async fn test_sink_is_weak() {
        let (peer, sink) = make_peer("a");
        assert!(peer.sink().is_some());
        drop(sink);
        assert!(peer.sink().is_none());
    }

    #[tokio::test]
    async fn test_consistency_checker() {
        let mut registry = Registry::new();
        let (mut peer, _sink) = make_peer("a");
        peer.room = Some("r1".into());
        registry.register(peer).unwrap();

        // Peer claims a room it is not indexed under
        assert!(registry.check_consistency().is_err());

        registry.join_room("r1", &PeerId::from("a"));
        assert!(registry.check_consistency().is_ok());

        // Index lists a peer that is gone
        registry.remove("a");
        assert!(registry.check_consistency().is_err());
    }
}

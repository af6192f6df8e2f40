//! Shared relay state
//!
//! [`Hub`] is the only shared mutable state in the relay. It wraps the
//! [`Registry`] in a single mutex and exposes composite operations that keep
//! peers and rooms consistent. The lock is never held across an await: each
//! operation returns a snapshot of the [`Recipient`]s to notify, and the
//! caller performs the sends after the lock is released.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use switchboard_core::PeerId;

use crate::messages::{LeaveReason, PeerSummary, ServerMessage};
use crate::registry::{PeerRecord, Registry, RegistryError};
use crate::transport::{FrameSink, TransportError};

/// A peer to deliver a frame to, captured under the lock
#[derive(Clone)]
pub struct Recipient {
    pub peer_id: PeerId,
    sink: Arc<dyn FrameSink>,
}

impl Recipient {
    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        self.sink.send_text(text).await
    }
}

impl std::fmt::Debug for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recipient")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// Deliver a frame to every recipient. Failures are logged and skipped.
/// Returns the number of successful deliveries.
pub async fn fan_out(recipients: &[Recipient], frame: &str) -> usize {
    let mut delivered = 0;
    for recipient in recipients {
        match recipient.send(frame.to_string()).await {
            Ok(()) => delivered += 1,
            Err(e) => warn!("Delivery to {} failed: {}", recipient.peer_id, e),
        }
    }
    delivered
}

/// Serialize a relay-originated message and fan it out
pub async fn announce(recipients: &[Recipient], msg: &ServerMessage) -> usize {
    if recipients.is_empty() {
        return 0;
    }
    match msg.to_json() {
        Ok(json) => fan_out(recipients, &json).await,
        Err(e) => {
            error!("Failed to encode {:?}: {}", msg, e);
            0
        }
    }
}

/// A room a peer just left, and who remains in it
#[derive(Debug)]
pub struct Departure {
    pub room: String,
    pub audience: Vec<Recipient>,
}

/// Result of a successful join
#[derive(Debug)]
pub struct JoinOutcome {
    /// Room left in the process, if the peer switched rooms
    pub previous: Option<Departure>,
    /// Other members of the new room
    pub roster: Vec<PeerSummary>,
    /// The same members, for the `peer-joined` announcement
    pub audience: Vec<Recipient>,
}

/// A peer taken out of the registry
#[derive(Debug)]
pub struct Removal {
    pub peer: PeerRecord,
    pub departure: Option<Departure>,
}

impl Removal {
    /// Tell the rest of the departed room why the peer left
    pub async fn announce(self, reason: LeaveReason) {
        let peer_id = self.peer.peer_id;
        info!(
            "Removed peer {} (reason: {}, room: {:?})",
            peer_id, reason, self.peer.room
        );

        if let Some(departure) = self.departure {
            let msg = ServerMessage::PeerLeft { peer_id, reason };
            announce(&departure.audience, &msg).await;
        }
    }
}

/// What the liveness monitor needs to decide on a peer
pub struct Probe {
    pub last_seen: Instant,
    pub sink: Option<Arc<dyn FrameSink>>,
}

/// Peer registry and room index behind one lock
#[derive(Default)]
pub struct Hub {
    state: Mutex<Registry>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection
    pub fn register(&self, peer: PeerRecord) -> Result<(), RegistryError> {
        self.state.lock().register(peer)
    }

    /// Refresh `last_seen`; false if the peer is gone
    pub fn touch(&self, peer_id: &str) -> bool {
        match self.state.lock().lookup_mut(peer_id) {
            Some(peer) => {
                peer.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Move a peer into `room`, leaving its current room if different.
    /// Returns `None` if the peer is no longer registered.
    pub fn join(&self, peer_id: &PeerId, room: &str, name: &str) -> Option<JoinOutcome> {
        let mut state = self.state.lock();

        let current = state.lookup(peer_id.as_str())?.room.clone();
        let previous = match current {
            Some(old) if old != room => {
                state.leave_room(&old, peer_id.as_str());
                let audience = audience(&state, &old, peer_id);
                Some(Departure {
                    room: old,
                    audience,
                })
            }
            _ => None,
        };

        let peer = state.lookup_mut(peer_id.as_str())?;
        peer.room = Some(room.to_string());
        peer.name = name.to_string();
        state.join_room(room, peer_id);

        let roster: Vec<PeerSummary> = state
            .room_members(room)
            .iter()
            .filter(|id| *id != peer_id)
            .filter_map(|id| state.lookup(id.as_str()))
            .map(PeerRecord::summary)
            .collect();
        let audience = audience(&state, room, peer_id);

        debug!(
            "{} joined {} ({} members)",
            peer_id,
            room,
            roster.len() + 1
        );

        Some(JoinOutcome {
            previous,
            roster,
            audience,
        })
    }

    /// Take a peer out of its room. `None` if it was not in one.
    pub fn leave(&self, peer_id: &PeerId) -> Option<Departure> {
        let mut state = self.state.lock();

        let room = state.lookup_mut(peer_id.as_str())?.room.take()?;
        state.leave_room(&room, peer_id.as_str());
        let audience = audience(&state, &room, peer_id);

        Some(Departure { room, audience })
    }

    /// Sender's room and its other members, for a broadcast
    pub fn room_audience(&self, peer_id: &PeerId) -> Option<Departure> {
        let state = self.state.lock();
        let room = state.lookup(peer_id.as_str())?.room.clone()?;
        let audience = audience(&state, &room, peer_id);
        Some(Departure { room, audience })
    }

    /// A single peer to relay to
    pub fn recipient(&self, peer_id: &PeerId) -> Option<Recipient> {
        let state = self.state.lock();
        let peer = state.lookup(peer_id.as_str())?;
        Some(Recipient {
            peer_id: peer.peer_id.clone(),
            sink: peer.sink()?,
        })
    }

    pub fn probe(&self, peer_id: &PeerId) -> Option<Probe> {
        let state = self.state.lock();
        let peer = state.lookup(peer_id.as_str())?;
        Some(Probe {
            last_seen: peer.last_seen,
            sink: peer.sink(),
        })
    }

    /// Deregister a peer and drop it from its room, pruning the room if empty.
    /// `None` if the peer was already removed.
    pub fn remove(&self, peer_id: &PeerId) -> Option<Removal> {
        let mut state = self.state.lock();

        let peer = state.remove(peer_id.as_str())?;
        let departure = peer.room.clone().map(|room| {
            state.leave_room(&room, peer_id.as_str());
            let audience = audience(&state, &room, peer_id);
            Departure { room, audience }
        });

        Some(Removal { peer, departure })
    }

    /// Remove a peer and tell the rest of its room why.
    /// Returns false if the peer was already gone.
    pub async fn evict(&self, peer_id: &PeerId, reason: LeaveReason) -> bool {
        let Some(removal) = self.remove(peer_id) else {
            return false;
        };
        removal.announce(reason).await;
        true
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peer_count()
    }

    pub fn room_count(&self) -> usize {
        self.state.lock().room_count()
    }

    /// Roster of a room, sorted by peer id
    pub fn roster(&self, room: &str) -> Vec<PeerSummary> {
        let state = self.state.lock();
        state
            .room_members(room)
            .iter()
            .filter_map(|id| state.lookup(id.as_str()))
            .map(PeerRecord::summary)
            .collect()
    }

    /// Verify that peers and rooms agree with each other
    pub fn check_consistency(&self) -> Result<(), String> {
        self.state.lock().check_consistency()
    }
}

/// Live members of `room` other than `exclude`
fn audience(state: &Registry, room: &str, exclude: &PeerId) -> Vec<Recipient> {
    state
        .room_members(room)
        .into_iter()
        .filter(|id| id != exclude)
        .filter_map(|id| {
            let sink = state.lookup(id.as_str())?.sink()?;
            Some(Recipient { peer_id: id, sink })
        })
        .collect()
}

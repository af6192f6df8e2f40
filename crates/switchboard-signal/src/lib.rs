//! Switchboard Signal Relay
//!
//! In-memory signaling relay for WebRTC-style session negotiation.
//! Clients connect via WebSocket, get an opaque peer id, group themselves
//! into named rooms and exchange offer/answer/ICE messages through the
//! relay. Payloads are forwarded without interpretation.
//!
//! # Protocol
//!
//! 1. Server sends `welcome` with the assigned `peer_id`
//! 2. Client sends `join` with a room name (and optional display name)
//! 3. Server replies `joined` with the roster and announces `peer-joined`
//! 4. Messages with a `to` field are relayed to that peer, stamped with `from`
//! 5. `broadcast` messages are fanned out to the rest of the room
//! 6. Server pings every connection; idle peers are evicted

pub mod hub;
pub mod liveness;
pub mod messages;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;

pub use hub::{Hub, Recipient};
pub use messages::{Inbound, LeaveReason, PeerSummary, ServerMessage};
pub use registry::{PeerRecord, Registry, RegistryError};
pub use router::Router;
pub use server::SignalServer;
pub use session::{run_session, SessionError, SessionState};
pub use transport::{FrameSink, FrameSource, TransportError};

pub use switchboard_core::{Config, PeerId, RouteError};

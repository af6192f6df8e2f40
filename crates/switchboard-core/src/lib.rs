//! Switchboard Core - Shared configuration, error taxonomy and peer identifiers
//!
//! This crate contains the foundational types used by the signaling relay.
//! It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod id;

pub use config::{Config, ConfigError, LivenessConfig, LoggingConfig, ServerConfig};
pub use error::*;
pub use id::{generate_peer_id, IdError, PeerId};

/// Default listening port
pub const DEFAULT_PORT: u16 = 8765;

/// Default interval between liveness probes in seconds
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 15;

/// Default idle time after which a peer is evicted, in seconds
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 45;

/// Maximum inbound frame size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

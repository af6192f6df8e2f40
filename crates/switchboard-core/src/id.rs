//! Peer identifier generation
//!
//! Identifiers are 8 bytes from the operating system CSPRNG, hex encoded:
//! 16 URL-safe characters carrying 64 bits of entropy. Uniqueness is
//! probabilistic and is not checked against previously issued ids.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of random bytes in a peer id
pub const PEER_ID_BYTES: usize = 8;

/// Opaque identifier assigned to a connection when it is accepted
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Failure to read from the system entropy source
#[derive(Error, Debug)]
#[error("system entropy source unavailable: {0}")]
pub struct IdError(String);

/// Generate a fresh random peer id
pub fn generate_peer_id() -> Result<PeerId, IdError> {
    let mut bytes = [0u8; PEER_ID_BYTES];
    getrandom::fill(&mut bytes).map_err(|e| IdError(e.to_string()))?;
    Ok(PeerId(hex::encode(bytes)))
}

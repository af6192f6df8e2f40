//! Error types for the signaling protocol
//!
//! Every [`RouteError`] is session-local: it is reported back to the
//! originating connection as an `error` frame and never closes the session.
//! The `Display` text of each variant is the exact `error` string put on the
//! wire.

use std::fmt;

use thiserror::Error;

/// Frame-level protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Frame is not parseable as JSON
    #[error("invalid-json")]
    MalformedFrame { detail: String },

    /// Frame parsed but is not an object with a string `type`
    #[error("{0}")]
    InvalidShape(ShapeProblem),

    /// A required field is missing or empty
    #[error("{0}")]
    MissingField(RequiredField),

    /// Relay target is not registered (or its transport rejected the frame)
    #[error("peer-not-found")]
    PeerNotFound { to: String },

    /// Broadcast attempted without room membership
    #[error("not-in-room")]
    NotInRoom,

    /// Unrecognized `type` with no `to` field
    #[error("unknown type: {0}")]
    UnknownType(String),
}

/// Why a parsed frame was rejected as structurally invalid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeProblem {
    NotAnObject,
    MissingType,
}

impl fmt::Display for ShapeProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeProblem::NotAnObject => write!(f, "message must be a JSON object"),
            ShapeProblem::MissingType => write!(f, "missing/invalid \"type\""),
        }
    }
}

/// Fields that some message types require
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredField {
    Room,
    To,
}

impl fmt::Display for RequiredField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequiredField::Room => write!(f, "join requires room"),
            RequiredField::To => write!(f, "invalid \"to\""),
        }
    }
}

impl RouteError {
    /// Parse failure with the decoder's message kept for logs
    pub fn malformed(detail: impl Into<String>) -> Self {
        RouteError::MalformedFrame {
            detail: detail.into(),
        }
    }

    /// Extra key/value pairs that accompany the error string on the wire
    pub fn context(&self) -> Option<(&'static str, &str)> {
        match self {
            RouteError::PeerNotFound { to } => Some(("to", to.as_str())),
            _ => None,
        }
    }

    /// Stable name of the error class, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            RouteError::MalformedFrame { .. } => "malformed_frame",
            RouteError::InvalidShape(_) => "invalid_shape",
            RouteError::MissingField(_) => "missing_field",
            RouteError::PeerNotFound { .. } => "peer_not_found",
            RouteError::NotInRoom => "not_in_room",
            RouteError::UnknownType(_) => "unknown_type",
        }
    }
}

//! Signal protocol messages
//!
//! Inbound frames are validated once at the boundary ([`Envelope::parse`])
//! and then classified into a closed set of [`Inbound`] variants. Frames the
//! relay does not understand keep their raw body so they can still be relayed.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use switchboard_core::{PeerId, RequiredField, RouteError, ShapeProblem};

/// A JSON object
pub type Object = Map<String, Value>;

/// A frame that is a JSON object with a string `type`
#[derive(Clone, Debug)]
pub struct Envelope {
    kind: String,
    body: Object,
}

impl Envelope {
    /// Parse and structurally validate a raw text frame
    pub fn parse(raw: &str) -> Result<Self, RouteError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| RouteError::malformed(e.to_string()))?;

        let Value::Object(body) = value else {
            return Err(RouteError::InvalidShape(ShapeProblem::NotAnObject));
        };

        let kind = match body.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(RouteError::InvalidShape(ShapeProblem::MissingType)),
        };

        Ok(Self { kind, body })
    }

    /// The `type` field
    pub fn kind(&self) -> &str {
        &self.kind
    }
}

/// Messages a client may send, after validation
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    /// Liveness ack
    Pong,

    /// Enter a room (leaving any other)
    Join { room: String, name: String },

    /// Leave the current room
    Leave,

    /// Directed message for a single peer (offer/answer/ice or anything else)
    Relay {
        kind: String,
        to: PeerId,
        message: Object,
    },

    /// Fan-out to the rest of the sender's room
    Broadcast { message: Object },

    /// Unrecognized type without a recipient
    Other { kind: String, message: Object },
}

impl Inbound {
    /// Classify a validated envelope.
    ///
    /// `join`, `leave` and `pong` take priority; any other frame carrying a
    /// `to` field is a relay regardless of its type.
    pub fn classify(envelope: Envelope) -> Result<Self, RouteError> {
        let Envelope { kind, body } = envelope;

        match kind.as_str() {
            "pong" => Ok(Inbound::Pong),
            "join" => {
                let room = text_field(&body, "room");
                if room.is_empty() {
                    return Err(RouteError::MissingField(RequiredField::Room));
                }
                let name = text_field(&body, "name");
                Ok(Inbound::Join { room, name })
            }
            "leave" => Ok(Inbound::Leave),
            _ if body.contains_key("to") => {
                let to = text_field(&body, "to");
                if to.is_empty() {
                    return Err(RouteError::MissingField(RequiredField::To));
                }
                Ok(Inbound::Relay {
                    kind,
                    to: PeerId::from(to),
                    message: body,
                })
            }
            "broadcast" => Ok(Inbound::Broadcast { message: body }),
            _ => Ok(Inbound::Other {
                kind,
                message: body,
            }),
        }
    }
}

/// Read a field as trimmed text. Scalars are rendered, anything else is empty.
///
/// `null`, objects and arrays are not stringified, so a `to` of that kind is
/// rejected as `invalid "to"` and a `room` of that kind as `join requires
/// room`, rather than being looked up under a rendered name like `"None"`.
fn text_field(body: &Object, key: &str) -> String {
    match body.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Copy a client message for forwarding, stamping the sender id
pub fn stamp_from(mut message: Object, from: &PeerId) -> Object {
    message.insert("from".into(), Value::String(from.to_string()));
    message
}

/// Roster entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub name: String,
}

/// Why a peer left a room
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaveReason {
    Left,
    SwitchedRoom,
    Disconnect,
    Timeout,
    SendFailed,
}

impl LeaveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Left => "left",
            LeaveReason::SwitchedRoom => "switched-room",
            LeaveReason::Disconnect => "disconnect",
            LeaveReason::Timeout => "timeout",
            LeaveReason::SendFailed => "send-failed",
        }
    }
}

impl fmt::Display for LeaveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages originated by the relay itself
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent once on connect
    Welcome { peer_id: PeerId },

    /// Liveness probe
    Ping { ts: i64 },

    /// Join accepted; roster excludes the joiner
    Joined {
        room: String,
        peers: Vec<PeerSummary>,
    },

    /// Someone entered the room
    PeerJoined { peer: PeerSummary },

    /// Leave accepted
    Left { room: String },

    /// Someone left the room
    PeerLeft { peer_id: PeerId, reason: LeaveReason },

    /// Error response, only ever sent to the connection that caused it
    Error {
        error: String,
        #[serde(flatten)]
        context: Object,
    },
}

impl ServerMessage {
    /// Build the error frame for a rejected message
    pub fn error(err: &RouteError) -> Self {
        let mut context = Object::new();
        if let Some((key, value)) = err.context() {
            context.insert(key.into(), Value::String(value.to_string()));
        }
        Self::Error {
            error: err.to_string(),
            context,
        }
    }

    /// Liveness probe stamped with the current unix time
    pub fn ping_now() -> Self {
        Self::Ping {
            ts: chrono::Utc::now().timestamp(),
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

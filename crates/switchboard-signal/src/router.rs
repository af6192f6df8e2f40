//! Message routing
//!
//! Routing happens in two phases. [`Router::plan`] validates a frame, applies
//! its state change through the [`Hub`] and returns the frames to send, in
//! order. [`Router::handle`] then performs the sends with no lock held.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use switchboard_core::{PeerId, RouteError};

use crate::hub::{announce, fan_out, Hub, Recipient};
use crate::messages::{stamp_from, Envelope, Inbound, LeaveReason, Object, PeerSummary, ServerMessage};
use crate::transport::{FrameSink, TransportError};

/// Body of a frame headed to other peers
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Built by the relay
    Server(ServerMessage),
    /// A client message passed through with `from` stamped
    Relayed(Object),
}

impl Payload {
    fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Payload::Server(msg) => msg.to_json(),
            Payload::Relayed(body) => serde_json::to_string(body),
        }
    }
}

/// One send produced by routing a frame
#[derive(Debug)]
pub enum Outgoing {
    /// To the connection that sent the frame; failure is fatal to that session
    Reply(ServerMessage),
    /// To other peers; each failure is logged and skipped
    Deliver {
        recipients: Vec<Recipient>,
        payload: Payload,
    },
    /// Directed relay; failure is reported back to the sender
    Relay {
        recipient: Recipient,
        message: Object,
    },
}

/// Routes validated frames between peers
#[derive(Clone)]
pub struct Router {
    hub: Arc<Hub>,
}

impl Router {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Validate a raw frame from `sender`, apply it and return what to send
    pub fn plan(&self, sender: &PeerId, raw: &str) -> Result<Vec<Outgoing>, RouteError> {
        let envelope = Envelope::parse(raw)?;

        if !self.hub.touch(sender.as_str()) {
            debug!("Dropping frame from removed peer {}", sender);
            return Ok(Vec::new());
        }

        if !matches!(envelope.kind(), "ping" | "pong") {
            debug!("Received {} from {}", envelope.kind(), sender);
        }

        match Inbound::classify(envelope)? {
            Inbound::Pong => Ok(Vec::new()),
            Inbound::Join { room, name } => Ok(self.join(sender, room, name)),
            Inbound::Leave => Ok(self.leave(sender)),
            Inbound::Relay { kind, to, message } => self.relay(sender, &kind, to, message),
            Inbound::Broadcast { message } => self.broadcast(sender, message),
            Inbound::Other { kind, .. } => Err(RouteError::UnknownType(kind)),
        }
    }

    fn join(&self, sender: &PeerId, room: String, name: String) -> Vec<Outgoing> {
        let Some(outcome) = self.hub.join(sender, &room, &name) else {
            return Vec::new();
        };

        info!(
            "Peer {} joined room {} (name set: {}, members: {})",
            sender,
            room,
            !name.is_empty(),
            outcome.roster.len() + 1
        );

        let mut out = Vec::with_capacity(3);
        if let Some(previous) = outcome.previous {
            info!("Peer {} switched away from room {}", sender, previous.room);
            out.push(Outgoing::Deliver {
                recipients: previous.audience,
                payload: Payload::Server(ServerMessage::PeerLeft {
                    peer_id: sender.clone(),
                    reason: LeaveReason::SwitchedRoom,
                }),
            });
        }
        out.push(Outgoing::Reply(ServerMessage::Joined {
            room,
            peers: outcome.roster,
        }));
        out.push(Outgoing::Deliver {
            recipients: outcome.audience,
            payload: Payload::Server(ServerMessage::PeerJoined {
                peer: PeerSummary {
                    peer_id: sender.clone(),
                    name,
                },
            }),
        });
        out
    }

    fn leave(&self, sender: &PeerId) -> Vec<Outgoing> {
        let Some(departure) = self.hub.leave(sender) else {
            return Vec::new();
        };

        info!("Peer {} left room {}", sender, departure.room);

        vec![
            Outgoing::Reply(ServerMessage::Left {
                room: departure.room,
            }),
            Outgoing::Deliver {
                recipients: departure.audience,
                payload: Payload::Server(ServerMessage::PeerLeft {
                    peer_id: sender.clone(),
                    reason: LeaveReason::Left,
                }),
            },
        ]
    }

    fn relay(
        &self,
        sender: &PeerId,
        kind: &str,
        to: PeerId,
        message: Object,
    ) -> Result<Vec<Outgoing>, RouteError> {
        match kind {
            "offer" | "answer" => {
                let sdp_len = message
                    .get("sdp")
                    .and_then(|v| v.as_str())
                    .map_or(0, str::len);
                info!("Relay {} from {} to {} (sdp: {} bytes)", kind, sender, to, sdp_len);
            }
            "ice" => debug!("Relay ice from {} to {}", sender, to),
            _ => debug!("Relay {} from {} to {}", kind, sender, to),
        }

        let Some(recipient) = self.hub.recipient(&to) else {
            info!("Relay {} from {} failed: {} not found", kind, sender, to);
            return Err(RouteError::PeerNotFound { to: to.to_string() });
        };

        Ok(vec![Outgoing::Relay {
            recipient,
            message: stamp_from(message, sender),
        }])
    }

    fn broadcast(&self, sender: &PeerId, message: Object) -> Result<Vec<Outgoing>, RouteError> {
        let room = self.hub.room_audience(sender).ok_or(RouteError::NotInRoom)?;

        info!(
            "Broadcast from {} to room {} ({} recipients)",
            sender,
            room.room,
            room.audience.len()
        );

        Ok(vec![Outgoing::Deliver {
            recipients: room.audience,
            payload: Payload::Relayed(stamp_from(message, sender)),
        }])
    }

    /// Route one frame and perform the resulting sends.
    ///
    /// Routing errors become an `error` reply. Only a failure to write to the
    /// sender's own transport is returned.
    pub async fn handle(
        &self,
        sender: &PeerId,
        reply: &dyn FrameSink,
        raw: &str,
    ) -> Result<(), TransportError> {
        let outgoing = match self.plan(sender, raw) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                warn!("Rejected frame from {} ({}): {:?}", sender, e.kind(), e);
                vec![Outgoing::Reply(ServerMessage::error(&e))]
            }
        };

        for item in outgoing {
            self.execute(sender, reply, item).await?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        sender: &PeerId,
        reply: &dyn FrameSink,
        item: Outgoing,
    ) -> Result<(), TransportError> {
        match item {
            Outgoing::Reply(msg) => match msg.to_json() {
                Ok(json) => reply.send_text(json).await,
                Err(e) => {
                    error!("Failed to encode reply {:?}: {}", msg, e);
                    Ok(())
                }
            },
            Outgoing::Deliver {
                recipients,
                payload,
            } => {
                match payload {
                    Payload::Server(msg) => {
                        announce(&recipients, &msg).await;
                    }
                    relayed => match relayed.encode() {
                        Ok(json) => {
                            fan_out(&recipients, &json).await;
                        }
                        Err(e) => error!("Failed to encode broadcast from {}: {}", sender, e),
                    },
                }
                Ok(())
            }
            Outgoing::Relay { recipient, message } => {
                let delivered = match serde_json::to_string(&message) {
                    Ok(json) => recipient.send(json).await.is_ok(),
                    Err(e) => {
                        error!("Failed to encode relay from {}: {}", sender, e);
                        false
                    }
                };
                if delivered {
                    return Ok(());
                }

                info!("Relay from {} to {} failed", sender, recipient.peer_id);
                let err = RouteError::PeerNotFound {
                    to: recipient.peer_id.to_string(),
                };
                match ServerMessage::error(&err).to_json() {
                    Ok(json) => reply.send_text(json).await,
                    Err(e) => {
                        error!("Failed to encode relay error: {}", e);
                        Ok(())
                    }
                }
            }
        }
    }
}

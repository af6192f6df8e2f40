//! Connection session
//!
//! Drives one connection through `Connecting -> Open -> Closed`: assign an
//! id, register, greet, start the liveness monitor, route frames until the
//! transport goes away, then tear down exactly once.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use switchboard_core::{generate_peer_id, IdError, PeerId};

use crate::liveness::{Heartbeat, LivenessMonitor};
use crate::messages::{LeaveReason, ServerMessage};
use crate::registry::{PeerRecord, RegistryError};
use crate::router::Router;
use crate::transport::{FrameSink, FrameSource, TransportError};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// Reasons a session could not be opened
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to generate peer id: {0}")]
    Id(#[from] IdError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Serve one connection to completion. Returns the id it was assigned.
pub async fn run_session<S>(
    router: Router,
    heartbeat: Heartbeat,
    sink: Arc<dyn FrameSink>,
    mut source: S,
) -> Result<PeerId, SessionError>
where
    S: FrameSource,
{
    let mut session = match Session::connect(router, sink.clone()) {
        Ok(session) => session,
        Err(e) => {
            sink.close().await;
            return Err(e);
        }
    };

    let peer_id = session.peer_id.clone();
    let span = info_span!("session", peer_id = %peer_id);
    async move {
        let reason = session.serve(heartbeat, &mut source).await;
        session.teardown(reason).await;
    }
    .instrument(span)
    .await;

    Ok(peer_id)
}

/// A registered connection. Dropping it before teardown still deregisters
/// the peer, so a cancelled or panicking session cannot leak registry state.
struct Session {
    router: Router,
    peer_id: PeerId,
    sink: Arc<dyn FrameSink>,
    monitor: Option<LivenessMonitor>,
    state: SessionState,
}

impl Session {
    fn connect(router: Router, sink: Arc<dyn FrameSink>) -> Result<Self, SessionError> {
        let peer_id = generate_peer_id()?;
        router
            .hub()
            .register(PeerRecord::new(peer_id.clone(), &sink))?;

        info!("Assigned peer id {}", peer_id);

        Ok(Self {
            router,
            peer_id,
            sink,
            monitor: None,
            state: SessionState::Connecting,
        })
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn send(&self, msg: &ServerMessage) -> Result<(), TransportError> {
        let json = msg
            .to_json()
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        self.sink.send_text(json).await
    }

    /// Greet, start the monitor and route frames. Returns why the loop ended.
    async fn serve<S: FrameSource>(&mut self, heartbeat: Heartbeat, source: &mut S) -> LeaveReason {
        let welcome = ServerMessage::Welcome {
            peer_id: self.peer_id.clone(),
        };
        if let Err(e) = self.send(&welcome).await {
            info!("Failed to send welcome: {}", e);
            return LeaveReason::SendFailed;
        }

        self.monitor = Some(LivenessMonitor::spawn(
            self.router.hub().clone(),
            self.peer_id.clone(),
            heartbeat,
        ));
        self.transition(SessionState::Open);

        loop {
            match source.recv_text().await {
                Ok(Some(frame)) => {
                    if let Err(e) = self.router.handle(&self.peer_id, &*self.sink, &frame).await {
                        info!("Send to {} failed: {}", self.peer_id, e);
                        return LeaveReason::SendFailed;
                    }
                }
                Ok(None) => {
                    info!("Peer {} disconnected", self.peer_id);
                    return LeaveReason::Disconnect;
                }
                Err(e) => {
                    warn!("Transport error for {}: {}", self.peer_id, e);
                    return LeaveReason::Disconnect;
                }
            }
        }
    }

    /// Stop the monitor, deregister (no-op if already evicted), close the transport.
    /// An eviction the monitor has started is allowed to finish first, so its
    /// reason and room notification win over `reason`.
    async fn teardown(mut self, reason: LeaveReason) {
        if let Some(monitor) = self.monitor.take() {
            let exit = monitor.cancel().await;
            debug!("Liveness monitor ended: {:?}", exit);
        }
        self.transition(SessionState::Closed);

        if !self.router.hub().evict(&self.peer_id, reason).await {
            debug!("Peer {} was already removed", self.peer_id);
        }
        self.sink.close().await;

        info!("Cleaned up peer {}", self.peer_id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        if let Some(monitor) = self.monitor.take() {
            drop(monitor);
        }

        let Some(removal) = self.router.hub().remove(&self.peer_id) else {
            return;
        };
        warn!("Session for {} dropped before teardown", self.peer_id);

        let sink = self.sink.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                removal.announce(LeaveReason::Disconnect).await;
                sink.close().await;
            });
        }
    }
}

//! Per-connection liveness monitor
//!
//! Each session starts one monitor task. Every interval it looks the peer up;
//! if the peer has been silent longer than the timeout the peer is evicted
//! and its connection closed, otherwise it is sent a `ping`. The task stops
//! on its own once the peer is gone.
//!
//! Stopping is cooperative: a stop request is only observed while the task
//! sleeps between probes, so an eviction that has started always finishes
//! notifying the room.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use switchboard_core::{LivenessConfig, PeerId};

use crate::hub::Hub;
use crate::messages::{LeaveReason, ServerMessage};
use crate::transport::FrameSink;

/// Probe cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<&LivenessConfig> for Heartbeat {
    fn from(config: &LivenessConfig) -> Self {
        Self {
            interval: config.ping_interval(),
            timeout: config.ping_timeout(),
        }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::from(&LivenessConfig::default())
    }
}

/// Why a monitor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Stop was requested while the monitor was idle
    Stopped,
    /// Peer was already removed by someone else
    PeerGone,
    /// Peer idled past the timeout and was evicted
    TimedOut,
    /// A ping could not be written and the peer was evicted
    SendFailed,
}

/// Handle to a running monitor. Dropping it requests a stop and detaches
/// the task, which still completes an eviction already under way.
pub struct LivenessMonitor {
    task: Option<JoinHandle<MonitorExit>>,
    stop: watch::Sender<bool>,
}

impl LivenessMonitor {
    pub fn spawn(hub: Arc<Hub>, peer_id: PeerId, heartbeat: Heartbeat) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_monitor(hub, peer_id, heartbeat, stop_rx));
        Self {
            task: Some(task),
            stop,
        }
    }

    /// Ask the monitor to stop and wait until it has
    pub async fn cancel(mut self) -> Option<MonitorExit> {
        self.stop.send_replace(true);
        let task = self.task.take()?;
        match task.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                if e.is_panic() {
                    error!("Liveness monitor panicked: {}", e);
                }
                None
            }
        }
    }

    /// Wait for the monitor to stop by itself
    pub async fn join(mut self) -> Option<MonitorExit> {
        let task = self.task.take()?;
        task.await.ok()
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

async fn run_monitor(
    hub: Arc<Hub>,
    peer_id: PeerId,
    heartbeat: Heartbeat,
    mut stop: watch::Receiver<bool>,
) -> MonitorExit {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(heartbeat.interval) => {}
            _ = stop.changed() => {
                debug!("Liveness monitor for {} stopped", peer_id);
                return MonitorExit::Stopped;
            }
        }

        let Some(probe) = hub.probe(&peer_id) else {
            debug!("Liveness monitor for {} stopping: peer gone", peer_id);
            return MonitorExit::PeerGone;
        };
        let Some(sink) = probe.sink else {
            debug!("Liveness monitor for {} stopping: transport dropped", peer_id);
            return MonitorExit::PeerGone;
        };

        let idle = probe.last_seen.elapsed();
        if idle > heartbeat.timeout {
            info!("Peer {} timed out after {:?} idle", peer_id, idle);
            if !evict(&hub, &peer_id, &*sink, LeaveReason::Timeout).await {
                return MonitorExit::PeerGone;
            }
            return MonitorExit::TimedOut;
        }

        let ping = match ServerMessage::ping_now().to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to encode ping: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.send_text(ping).await {
            info!("Ping to {} failed: {}", peer_id, e);
            if !evict(&hub, &peer_id, &*sink, LeaveReason::SendFailed).await {
                return MonitorExit::PeerGone;
            }
            return MonitorExit::SendFailed;
        }
    }
}

/// Deregister first so `reason` is the one recorded, then close the
/// transport (which ends the session) and notify the room. False if the
/// peer had already been removed.
async fn evict(
    hub: &Hub,
    peer_id: &PeerId,
    sink: &dyn FrameSink,
    reason: LeaveReason,
) -> bool {
    let removal = hub.remove(peer_id);
    sink.close().await;

    let Some(removal) = removal else {
        debug!("Peer {} was removed before eviction", peer_id);
        return false;
    };
    removal.announce(reason).await;
    true
}

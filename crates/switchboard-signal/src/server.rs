//! WebSocket signal server implementation
//!
//! One TCP listener serves both the relay (WebSocket upgrade) and plain HTTP
//! status requests. Each accepted stream is peeked to tell them apart.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use switchboard_core::Config;

use crate::hub::Hub;
use crate::liveness::Heartbeat;
use crate::router::Router;
use crate::session::run_session;
use crate::transport;

/// Largest request head inspected when classifying a stream
const PEEK_LIMIT: usize = 4096;

/// How long to wait for a complete request head
const PEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between peeks while the request head is incomplete
const PEEK_RETRY: Duration = Duration::from_millis(10);

/// What an accepted stream is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    WebSocket,
    Health,
    Stats,
    NotFound,
    /// Closed before sending anything
    Empty,
}

/// Signal server state
pub struct SignalServer {
    router: Router,
    heartbeat: Heartbeat,
    max_frame_bytes: usize,
}

impl SignalServer {
    pub fn new(config: &Config) -> Self {
        Self {
            router: Router::new(Arc::new(Hub::new())),
            heartbeat: Heartbeat::from(&config.liveness),
            max_frame_bytes: config.server.max_frame_bytes,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        self.router.hub()
    }

    /// Bind and start the signal server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", listener.local_addr()?);
        self.serve_listener(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let router = self.router.clone();
            let heartbeat = self.heartbeat;
            let max_frame_bytes = self.max_frame_bytes;

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, peer_addr, router, heartbeat, max_frame_bytes).await
                {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.hub().room_count()
    }

    /// Get peer count (for monitoring)
    pub fn peer_count(&self) -> usize {
        self.hub().peer_count()
    }
}

impl Default for SignalServer {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    router: Router,
    heartbeat: Heartbeat,
    max_frame_bytes: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let head = peek_head(&stream).await?;

    match classify_request(&head) {
        RequestKind::Empty => Ok(()),
        RequestKind::WebSocket => {
            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(max_frame_bytes);
            ws_config.max_frame_size = Some(max_frame_bytes);

            let ws = accept_async_with_config(stream, Some(ws_config)).await?;
            info!("WebSocket connected from {}", peer_addr);

            let (sink, source) = transport::websocket(ws);
            run_session(router, heartbeat, Arc::new(sink), source).await?;
            Ok(())
        }
        kind => {
            debug!("HTTP {:?} request from {}", kind, peer_addr);
            // Consume the request we peeked at
            let mut buf = vec![0u8; PEEK_LIMIT];
            let _ = stream.read(&mut buf).await?;

            let response = http_response(kind, router.hub());
            stream.write_all(response.as_bytes()).await?;
            stream.shutdown().await?;
            Ok(())
        }
    }
}

/// Peek until the request head is complete, the buffer fills or time runs out
async fn peek_head(stream: &TcpStream) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = vec![0u8; PEEK_LIMIT];
    let deadline = Instant::now() + PEEK_TIMEOUT;

    loop {
        let n = stream.peek(&mut buf).await?;
        let complete = buf[..n].windows(4).any(|w| w == b"\r\n\r\n");

        if n == 0 || n == buf.len() || complete || Instant::now() >= deadline {
            buf.truncate(n);
            return Ok(buf);
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
}

/// Decide what a request head is asking for
pub fn classify_request(head: &[u8]) -> RequestKind {
    if head.is_empty() {
        return RequestKind::Empty;
    }

    let text = String::from_utf8_lossy(head);
    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or("");

    let is_upgrade = lines.any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value.trim().eq_ignore_ascii_case("websocket")
        })
    });
    if is_upgrade {
        return RequestKind::WebSocket;
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts
        .next()
        .unwrap_or("/")
        .split('?')
        .next()
        .unwrap_or("/");

    match (method, path) {
        ("GET", "/health") => RequestKind::Health,
        ("GET", "/stats") => RequestKind::Stats,
        _ => RequestKind::NotFound,
    }
}

/// Build a complete HTTP/1.1 response for a status request
fn http_response(kind: RequestKind, hub: &Hub) -> String {
    let (status, body) = match kind {
        RequestKind::Health => (
            "200 OK",
            serde_json::json!({ "ok": true, "ts": chrono::Utc::now().timestamp() }),
        ),
        RequestKind::Stats => (
            "200 OK",
            serde_json::json!({ "peers": hub.peer_count(), "rooms": hub.room_count() }),
        ),
        _ => ("404 Not Found", serde_json::json!({ "error": "not found" })),
    };
    let body = body.to_string();

    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

//! Transport capability used by the relay
//!
//! A connection is split into a [`FrameSink`] (shared: the session, its
//! liveness monitor and other sessions' fan-out all write to it) and a
//! [`FrameSource`] owned by the session loop. Closing the sink also wakes the
//! source, so a session blocked on a silent client notices an eviction.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Outbound half of a connection
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Send one text frame
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Close the connection. Safe to call more than once.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Inbound half of a connection
#[async_trait]
pub trait FrameSource: Send {
    /// Next text frame, or `None` once the peer disconnected or the sink was closed
    async fn recv_text(&mut self) -> Result<Option<String>, TransportError>;
}

/// Split an accepted WebSocket into sink and source halves
pub fn websocket<S>(ws: WebSocketStream<S>) -> (WsSink<S>, WsSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = ws.split();
    let (closed_tx, closed_rx) = watch::channel(false);
    (
        WsSink {
            write: Mutex::new(write),
            closed: closed_tx,
        },
        WsSource {
            read,
            closed: closed_rx,
        },
    )
}

/// WebSocket write half
pub struct WsSink<S> {
    write: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(text))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
                e => TransportError::WebSocket(e.to_string()),
            })
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut write = self.write.lock().await;
        if let Err(e) = write.close().await {
            debug!("WebSocket close failed: {}", e);
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// WebSocket read half
pub struct WsSource<S> {
    read: SplitStream<WebSocketStream<S>>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.closed.wait_for(|closed| *closed) => return Ok(None),
                next = self.read.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()))
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Control frames are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
            }
        }
    }
}

/// Create an in-memory connection: server-side sink and source plus the client end
pub fn channel() -> (ChannelSink, ChannelSource, ChannelClient) {
    let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);

    (
        ChannelSink {
            outbound: parking_lot::Mutex::new(Some(to_client_tx)),
            closed: closed_tx,
        },
        ChannelSource {
            inbound: to_server_rx,
            closed: closed_rx,
        },
        ChannelClient {
            outbound: Some(to_server_tx),
            inbound: to_client_rx,
        },
    )
}

/// In-memory write half
pub struct ChannelSink {
    outbound: parking_lot::Mutex<Option<mpsc::UnboundedSender<String>>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(text).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        self.outbound.lock().take();
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// In-memory read half
pub struct ChannelSource {
    inbound: mpsc::UnboundedReceiver<String>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => Ok(None),
            frame = self.inbound.recv() => Ok(frame),
        }
    }
}

/// The remote end of an in-memory connection
pub struct ChannelClient {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<String>,
}

impl ChannelClient {
    /// Send a frame to the server; false once disconnected
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.outbound
            .as_ref()
            .is_some_and(|tx| tx.send(text.into()).is_ok())
    }

    /// Next frame from the server, `None` once the server closed the connection
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    /// A frame that is already waiting, if any
    pub fn try_recv(&mut self) -> Option<String> {
        self.inbound.try_recv().ok()
    }

    /// Stop accepting frames from the server; later server sends fail
    pub fn stop_reading(&mut self) {
        self.inbound.close();
    }

    /// Disconnect from the server side
    pub fn disconnect(&mut self) {
        self.outbound.take();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_roundtrip() {
        let (sink, mut source, mut client) = channel();

        assert!(client.send("hello"));
        assert_eq!(source.recv_text().await.unwrap().as_deref(), Some("hello"));

        sink.send_text("world".into()).await.unwrap();
        assert_eq!(client.recv().await.as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn test_channel_disconnect_ends_source() {
        let (_sink, mut source, mut client) = channel();
        client.disconnect();
        assert_eq!(source.recv_text().await.unwrap(), None);
        assert!(!client.send("late"));
    }

    #[tokio::test]
    async fn test_channel_close_wakes_source() {
        let (sink, mut source, mut client) = channel();
        assert!(!sink.is_closed());

        sink.close().await;
        sink.close().await;

        assert!(sink.is_closed());
        assert_eq!(source.recv_text().await.unwrap(), None);
        assert_eq!(client.recv().await, None);
        assert_eq!(sink.send_text("x".into()).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_channel_send_fails_when_reader_gone() {
        let (sink, _source, mut client) = channel();
        client.stop_reading();
        assert_eq!(sink.send_text("x".into()).await, Err(TransportError::Closed));
    }
}

//! End-to-end tests for the signal server.
//!
//! Runs the real listener on an ephemeral port and drives it with
//! tokio-tungstenite clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use switchboard_core::Config;
use switchboard_signal::{Hub, SignalServer};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Test client that connects to the relay.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    peer_id: String,
}

impl TestClient {
    /// Connect and read the welcome frame.
    async fn connect(addr: SocketAddr) -> Self {
        let url = format!("ws://{}/ws", addr);
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");

        let mut client = Self {
            ws,
            peer_id: String::new(),
        };

        let welcome = client.recv().await;
        assert_eq!(welcome["type"], "welcome");
        client.peer_id = welcome["peer_id"].as_str().unwrap().to_string();
        client
    }

    async fn send(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("Failed to send");
    }

    /// Next frame, including pings.
    async fn recv_any(&mut self) -> Option<Value> {
        loop {
            let next = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("Timed out waiting for frame");
            match next {
                Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Next non-ping frame.
    async fn recv(&mut self) -> Value {
        loop {
            let msg = self.recv_any().await.expect("Connection closed");
            if msg["type"] != "ping" {
                return msg;
            }
        }
    }

    async fn join(&mut self, room: &str, name: &str) -> Value {
        self.send(json!({"type": "join", "room": room, "name": name}))
            .await;
        self.recv().await
    }
}

async fn start_server(config: Config) -> (SocketAddr, Arc<Hub>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SignalServer::new(&config);
    let hub = server.hub().clone();

    tokio::spawn(async move {
        let _ = server.serve_listener(listener).await;
    });

    (addr, hub)
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    timeout(RECV_TIMEOUT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

/// Wait until the hub reaches a peer count.
async fn wait_for_peers(hub: &Hub, count: usize) {
    timeout(RECV_TIMEOUT, async {
        while hub.peer_count() != count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer count never settled");
}

#[tokio::test]
async fn test_join_roster_and_announcement() {
    let (addr, hub) = start_server(Config::default()).await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;
    assert_ne!(a.peer_id, b.peer_id);

    assert_eq!(
        a.join("r1", "alice").await,
        json!({"type": "joined", "room": "r1", "peers": []})
    );
    assert_eq!(
        b.join("r1", "bob").await,
        json!({"type": "joined", "room": "r1", "peers": [{"peer_id": a.peer_id, "name": "alice"}]})
    );
    assert_eq!(
        a.recv().await,
        json!({"type": "peer-joined", "peer": {"peer_id": b.peer_id, "name": "bob"}})
    );

    assert_eq!(hub.room_count(), 1);
    hub.check_consistency().unwrap();
}

#[tokio::test]
async fn test_offer_relay() {
    let (addr, hub) = start_server(Config::default()).await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;

    a.send(json!({"type": "offer", "to": b.peer_id, "sdp": "v=0"}))
        .await;
    assert_eq!(
        b.recv().await,
        json!({"type": "offer", "from": a.peer_id, "to": b.peer_id, "sdp": "v=0"})
    );

    let gone = b.peer_id.clone();
    b.ws.close(None).await.unwrap();
    drop(b);
    wait_for_peers(&hub, 1).await;

    a.send(json!({"type": "answer", "to": gone, "sdp": "v=0"}))
        .await;
    assert_eq!(
        a.recv().await,
        json!({"type": "error", "error": "peer-not-found", "to": gone})
    );
}

#[tokio::test]
async fn test_broadcast_and_leave() {
    let (addr, hub) = start_server(Config::default()).await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;

    a.send(json!({"type": "broadcast", "msg": "hi"})).await;
    assert_eq!(a.recv().await, json!({"type": "error", "error": "not-in-room"}));

    a.join("r1", "").await;
    b.join("r1", "").await;
    a.recv().await; // peer-joined

    a.send(json!({"type": "broadcast", "msg": "hi"})).await;
    assert_eq!(
        b.recv().await,
        json!({"type": "broadcast", "from": a.peer_id, "msg": "hi"})
    );

    b.send(json!({"type": "leave"})).await;
    assert_eq!(b.recv().await, json!({"type": "left", "room": "r1"}));
    assert_eq!(
        a.recv().await,
        json!({"type": "peer-left", "peer_id": b.peer_id, "reason": "left"})
    );
    hub.check_consistency().unwrap();
}

#[tokio::test]
async fn test_disconnect_notifies_room() {
    let (addr, hub) = start_server(Config::default()).await;
    let mut a = TestClient::connect(addr).await;
    let mut b = TestClient::connect(addr).await;
    a.join("r1", "").await;
    b.join("r1", "").await;
    a.recv().await;

    let b_id = b.peer_id.clone();
    b.ws.close(None).await.unwrap();
    drop(b);

    assert_eq!(
        a.recv().await,
        json!({"type": "peer-left", "peer_id": b_id, "reason": "disconnect"})
    );
    wait_for_peers(&hub, 1).await;
    hub.check_consistency().unwrap();
}

#[tokio::test]
async fn test_bad_frame_keeps_connection() {
    let (addr, hub) = start_server(Config::default()).await;
    let mut a = TestClient::connect(addr).await;
    a.join("r1", "").await;

    a.send_raw("this is not json").await;
    assert_eq!(a.recv().await, json!({"type": "error", "error": "invalid-json"}));

    a.send(json!({"type": "warp"})).await;
    assert_eq!(
        a.recv().await,
        json!({"type": "error", "error": "unknown type: warp"})
    );

    assert_eq!(hub.peer_count(), 1);
    assert_eq!(hub.roster("r1").len(), 1);
}

#[tokio::test]
async fn test_idle_peer_is_evicted() {
    let mut config = Config::default();
    config.liveness.ping_interval_secs = 1;
    config.liveness.ping_timeout_secs = 3;
    let (addr, hub) = start_server(config).await;

    let mut silent = TestClient::connect(addr).await;
    let mut active = TestClient::connect(addr).await;
    silent.join("r1", "").await;
    active.join("r1", "").await;

    // The silent client never reads or answers; the active one pongs every ping
    let silent_id = silent.peer_id.clone();
    loop {
        let msg = active.recv_any().await.expect("active client was closed");
        match msg["type"].as_str() {
            Some("ping") => active.send(json!({"type": "pong"})).await,
            Some("peer-left") => {
                assert_eq!(
                    msg,
                    json!({"type": "peer-left", "peer_id": silent_id, "reason": "timeout"})
                );
                break;
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    wait_for_peers(&hub, 1).await;
    assert_eq!(hub.roster("r1").len(), 1);

    // The evicted client sees its connection close
    while silent.recv_any().await.is_some() {}
}

#[tokio::test]
async fn test_health_and_stats() {
    let (addr, _hub) = start_server(Config::default()).await;
    let _client = TestClient::connect(addr).await;

    let health = http_get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200 OK"));
    let body: Value = serde_json::from_str(health.split("\r\n\r\n").nth(1).unwrap()).unwrap();
    assert_eq!(body["ok"], true);
    assert!(body["ts"].as_i64().unwrap() > 0);

    let stats = http_get(addr, "/stats").await;
    let body: Value = serde_json::from_str(stats.split("\r\n\r\n").nth(1).unwrap()).unwrap();
    assert_eq!(body, json!({"peers": 1, "rooms": 0}));

    let missing = http_get(addr, "/nope").await;
    assert!(missing.starts_with("HTTP/1.1 404"));
}

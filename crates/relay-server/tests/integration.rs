//! End-to-end tests using real WebSocket clients against a live server.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use relay_server::source::channel;
use relay_server::{Payload, RelayConfig, RelayServer};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct Harness {
    server: RelayServer,
    publisher: mpsc::Sender<Payload>,
    base: String,
}

/// Boot a server on an auto-assigned port fed by an in-process channel.
async fn boot_server() -> Harness {
    let server = RelayServer::new(RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        shutdown_timeout_secs: 2,
        ..RelayConfig::default()
    });
    let addr = server.listen().await.unwrap();
    let (publisher, source) = channel(16, "integration");
    server.spawn_broadcast(source);

    timeout(TIMEOUT, async {
        while !server.counters().is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("broadcast loop never started");

    Harness {
        server,
        publisher,
        base: format!("127.0.0.1:{}", addr.port()),
    }
}

impl Harness {
    async fn connect(&self) -> WsStream {
        let url = format!("ws://{}/ws", self.base);
        let (ws, _) = connect_async(&url).await.expect("connect failed");
        ws
    }

    async fn publish(&self, text: &str) {
        self.publisher.send(Payload::from(text)).await.unwrap();
    }

    /// Wait until exactly `n` peers are registered.
    async fn wait_for_peers(&self, n: usize) {
        timeout(TIMEOUT, async {
            while self.server.registry().len().await != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("registry never reached {n} peers"));
    }

    /// Wait until the loop has broadcast `n` messages in total.
    async fn wait_for_messages(&self, n: u64) {
        timeout(TIMEOUT, async {
            while self.server.counters().messages_broadcast() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("loop never broadcast {n} messages"));
    }
}

/// Read the next text frame, skipping pings.
async fn recv_text(ws: &mut WsStream) -> String {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("recv timed out")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return text.as_str().to_owned(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn hello_reaches_all_then_world_reaches_survivor() {
    let h = boot_server().await;
    let mut c1 = h.connect().await;
    let mut c2 = h.connect().await;
    h.wait_for_peers(2).await;

    h.publish("hello").await;
    assert_eq!(recv_text(&mut c1).await, "hello");
    assert_eq!(recv_text(&mut c2).await, "hello");

    c1.close(None).await.unwrap();
    h.wait_for_peers(1).await;

    h.publish("world").await;
    assert_eq!(recv_text(&mut c2).await, "world");
    assert_eq!(h.server.registry().len().await, 1);

    h.server.shutdown().await;
}

#[tokio::test]
async fn publish_without_clients_then_late_joiner() {
    let h = boot_server().await;

    h.publish("nobody").await;
    h.wait_for_messages(1).await;
    assert_eq!(h.server.counters().snapshot().deliveries, 0);

    let mut late = h.connect().await;
    h.wait_for_peers(1).await;

    h.publish("later").await;
    assert_eq!(recv_text(&mut late).await, "later");

    h.server.shutdown().await;
}

#[tokio::test]
async fn per_client_order_matches_publish_order() {
    let h = boot_server().await;
    let mut c1 = h.connect().await;
    let mut c2 = h.connect().await;
    h.wait_for_peers(2).await;

    for i in 0..20 {
        h.publish(&format!("m{i}")).await;
    }
    for i in 0..20 {
        assert_eq!(recv_text(&mut c1).await, format!("m{i}"));
    }
    for i in 0..20 {
        assert_eq!(recv_text(&mut c2).await, format!("m{i}"));
    }

    h.server.shutdown().await;
}

#[tokio::test]
async fn dropped_client_does_not_affect_others() {
    let h = boot_server().await;
    let c1 = h.connect().await;
    let mut c2 = h.connect().await;
    h.wait_for_peers(2).await;

    // No close handshake, just the TCP connection going away.
    drop(c1);

    h.publish("still here").await;
    assert_eq!(recv_text(&mut c2).await, "still here");
    h.wait_for_peers(1).await;

    h.server.shutdown().await;
}

#[tokio::test]
async fn inbound_messages_are_ignored() {
    let h = boot_server().await;
    let mut c1 = h.connect().await;
    h.wait_for_peers(1).await;

    c1.send(Message::Text("ping from client".into())).await.unwrap();
    h.publish("reply-free").await;
    assert_eq!(recv_text(&mut c1).await, "reply-free");
    assert_eq!(h.server.registry().len().await, 1);

    h.server.shutdown().await;
}

#[tokio::test]
async fn health_reports_live_counts() {
    let h = boot_server().await;
    let _c1 = h.connect().await;
    h.wait_for_peers(1).await;
    h.publish("counted").await;
    h.wait_for_messages(1).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", h.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["broadcasting"], true);
    assert_eq!(body["messages_broadcast"], 1);

    h.server.shutdown().await;
}

#[tokio::test]
async fn closed_source_degrades_but_keeps_accepting() {
    let h = boot_server().await;
    let Harness {
        server,
        publisher,
        base,
    } = h;
    drop(publisher);

    timeout(TIMEOUT, async {
        while server.counters().is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("loop kept running after source closed");

    let (_ws, _) = connect_async(format!("ws://{base}/ws")).await.unwrap();
    let body: serde_json::Value = reqwest::get(format!("http://{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "degraded");

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_connected_clients() {
    let h = boot_server().await;
    let mut c1 = h.connect().await;
    h.wait_for_peers(1).await;

    h.server.shutdown().await;
    assert!(h.server.registry().is_empty().await);

    // The client sees a close frame or the stream ending.
    let next = timeout(TIMEOUT, c1.next()).await.expect("client never closed");
    assert!(matches!(
        next,
        None | Some(Ok(Message::Close(_)) | Err(_))
    ));
}

#[tokio::test]
async fn non_websocket_request_is_rejected() {
    let h = boot_server().await;
    let resp = reqwest::get(format!("http://{}/ws", h.base)).await.unwrap();
    assert!(resp.status().is_client_error());
    assert!(h.server.registry().is_empty().await);

    h.server.shutdown().await;
}

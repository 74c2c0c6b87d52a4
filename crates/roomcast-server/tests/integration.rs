//! End-to-end tests: real sockets against nodes sharing one in-process
//! backbone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use roomcast_backbone::{Backbone, MemoryHub};
use roomcast_core::{ClientFrame, RelayError};
use roomcast_server::{
    NodeState, PrefixTokenAuthenticator, RelayNode, ServerConfig, ServerHandle, start,
};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

async fn spawn_node_with(hub: &MemoryHub, config: ServerConfig) -> ServerHandle {
    let node = RelayNode::launch(config, Arc::new(hub.backbone()));
    start(node, Arc::new(PrefixTokenAuthenticator::default()), None)
        .await
        .unwrap()
}

async fn spawn_node(hub: &MemoryHub) -> ServerHandle {
    spawn_node_with(hub, ServerConfig::default()).await
}

async fn connect(handle: &ServerHandle, user: &str) -> Ws {
    let url = format!("{}?token=user:{user}", handle.ws_url());
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, frame: &ClientFrame) {
    ws.send(Message::text(frame.to_json())).await.unwrap();
}

async fn next_message(ws: &mut Ws) -> Option<Message> {
    loop {
        match tokio::time::timeout(WAIT, ws.next()).await {
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Ok(Some(Ok(msg))) => return Some(msg),
            Ok(Some(Err(_)) | None) | Err(_) => return None,
        }
    }
}

async fn recv_json(ws: &mut Ws) -> Value {
    match next_message(ws).await {
        Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

async fn assert_silent(ws: &mut Ws) {
    let got = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(_)) => {}
                _ => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(got.is_err(), "unexpected frame: {got:?}");
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_refcount(handle: &ServerHandle, room: &str, expected: usize) {
    let node = Arc::clone(handle.node());
    eventually(&format!("refcount {room} == {expected}"), || {
        let node = Arc::clone(&node);
        let room = room.to_owned();
        async move { node.subscriptions().refcount(&room).await == expected }
    })
    .await;
}

fn hello(body: &str) -> ClientFrame {
    ClientFrame::message("general", "text", json!({ "body": body }))
}

#[tokio::test]
async fn message_crosses_nodes_exactly_once() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let n2 = spawn_node(&hub).await;
    let mut alice = connect(&n1, "alice").await;
    let mut bob = connect(&n2, "bob").await;

    send(&mut alice, &ClientFrame::join("general")).await;
    send(&mut bob, &ClientFrame::join("general")).await;
    wait_refcount(&n1, "general", 1).await;
    wait_refcount(&n2, "general", 1).await;

    send(&mut alice, &hello("hi").with_client_id("c-1")).await;

    let at_bob = recv_json(&mut bob).await;
    assert_eq!(at_bob["sender_id"], "alice");
    assert_eq!(at_bob["room_id"], "general");
    assert_eq!(at_bob["type"], "text");
    assert_eq!(at_bob["payload"]["body"], "hi");
    assert_eq!(at_bob["client_id"], "c-1");
    assert_eq!(at_bob["origin_server"], n1.node().node_id().as_str());
    assert!(at_bob["message_id"].is_string());
    assert!(at_bob["created_at"].is_string());

    // Alice is still a member, so she gets exactly one local echo and no
    // second copy back through the backbone.
    let at_alice = recv_json(&mut alice).await;
    assert_eq!(at_alice["message_id"], at_bob["message_id"]);
    assert_silent(&mut alice).await;
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn sender_outside_room_gets_no_echo() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let mut alice = connect(&n1, "alice").await;
    let mut carol = connect(&n1, "carol").await;
    send(&mut carol, &ClientFrame::join("general")).await;
    wait_refcount(&n1, "general", 1).await;

    send(&mut alice, &hello("hi")).await;
    assert_eq!(recv_json(&mut carol).await["sender_id"], "alice");
    assert_silent(&mut alice).await;
    assert_silent(&mut carol).await;
}

#[tokio::test]
async fn refcount_follows_distinct_members() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let mut a = connect(&n1, "a").await;
    let mut b = connect(&n1, "b").await;
    let mut c = connect(&n1, "c").await;

    for ws in [&mut a, &mut b, &mut c] {
        send(ws, &ClientFrame::join("general")).await;
    }
    send(&mut a, &ClientFrame::join("general")).await;
    wait_refcount(&n1, "general", 3).await;
    assert_eq!(n1.node().rooms().member_count("general"), 3);
    assert_eq!(hub.subscriber_count("room.general"), 1);

    send(&mut a, &ClientFrame::leave("general")).await;
    wait_refcount(&n1, "general", 2).await;
    assert_eq!(hub.subscriber_count("room.general"), 1);

    send(&mut b, &ClientFrame::leave("general")).await;
    send(&mut c, &ClientFrame::leave("general")).await;
    wait_refcount(&n1, "general", 0).await;
    assert_eq!(hub.subscriber_count("room.general"), 0);
    assert_eq!(n1.node().rooms().room_count(), 0);
}

#[tokio::test]
async fn disconnect_leaves_every_room() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let mut alice = connect(&n1, "alice").await;
    let mut bob = connect(&n1, "bob").await;

    send(&mut alice, &ClientFrame::join("solo")).await;
    send(&mut alice, &ClientFrame::join("shared")).await;
    send(&mut bob, &ClientFrame::join("shared")).await;
    wait_refcount(&n1, "shared", 2).await;
    wait_refcount(&n1, "solo", 1).await;

    alice.close(None).await.unwrap();
    let node = Arc::clone(n1.node());
    eventually("alice deregistered", || {
        let node = Arc::clone(&node);
        async move { node.registry().len() == 1 }
    })
    .await;

    wait_refcount(&n1, "solo", 0).await;
    wait_refcount(&n1, "shared", 1).await;
    assert_eq!(hub.subscriber_count("room.solo"), 0);
    assert_eq!(hub.subscriber_count("room.shared"), 1);
}

#[tokio::test]
async fn client_close_tears_down_session() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let mut alice = connect(&n1, "alice").await;
    send(&mut alice, &ClientFrame::join("general")).await;
    wait_refcount(&n1, "general", 1).await;
    alice.close(None).await.unwrap();

    match next_message(&mut alice).await {
        Some(Message::Close(_)) | None => {}
        other => panic!("expected close, got {other:?}"),
    }
    let node = Arc::clone(n1.node());
    eventually("session torn down", || {
        let node = Arc::clone(&node);
        async move { node.registry().is_empty() && node.subscriptions().is_empty().await }
    })
    .await;
}

#[tokio::test]
async fn concurrent_churn_keeps_maps_consistent() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let rooms = ["r0", "r1", "r2"];

    let mut tasks = Vec::new();
    for i in 0..12 {
        let mut ws = connect(&n1, &format!("user{i}")).await;
        tasks.push(tokio::spawn(async move {
            for round in 0..10 {
                let room = rooms[(i + round) % rooms.len()];
                send(&mut ws, &ClientFrame::join(room)).await;
                if round % 2 == 0 {
                    send(&mut ws, &ClientFrame::leave(room)).await;
                }
            }
            ws
        }));
    }

    let mut sockets = Vec::new();
    for task in tasks {
        sockets.push(task.await.unwrap());
    }

    let node = Arc::clone(n1.node());
    eventually("refcounts match membership", || {
        let node = Arc::clone(&node);
        async move {
            for room in rooms {
                if node.subscriptions().refcount(room).await != node.rooms().member_count(room) {
                    return false;
                }
            }
            true
        }
    })
    .await;

    for mut ws in sockets {
        ws.close(None).await.unwrap();
    }
    eventually("everything released", || {
        let node = Arc::clone(&node);
        async move { node.registry().is_empty() && node.subscriptions().is_empty().await }
    })
    .await;
    for room in rooms {
        assert_eq!(hub.subscriber_count(&format!("room.{room}")), 0);
    }
}

#[tokio::test]
async fn publish_failure_keeps_local_delivery() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let n2 = spawn_node(&hub).await;
    let mut alice = connect(&n1, "alice").await;
    let mut carol = connect(&n1, "carol").await;
    let mut bob = connect(&n2, "bob").await;
    for ws in [&mut alice, &mut carol] {
        send(ws, &ClientFrame::join("general")).await;
    }
    send(&mut bob, &ClientFrame::join("general")).await;
    wait_refcount(&n1, "general", 2).await;
    wait_refcount(&n2, "general", 1).await;

    hub.set_fail_publish(true);
    send(&mut alice, &hello("local only")).await;

    assert_eq!(recv_json(&mut carol).await["payload"]["body"], "local only");
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn shutdown_closes_clients_with_going_away() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let node = Arc::clone(n1.node());
    let mut alice = connect(&n1, "alice").await;
    send(&mut alice, &ClientFrame::join("general")).await;
    wait_refcount(&n1, "general", 1).await;

    n1.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(node.state(), NodeState::Stopped);
    assert!(node.backbone().is_closed());

    match next_message(&mut alice).await {
        Some(Message::Close(Some(frame))) => {
            assert_eq!(u16::from(frame.code), 1001);
            assert_eq!(frame.reason.as_str(), "server shutting down");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn shutdown_past_deadline_returns_timeout() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let node = Arc::clone(n1.node());
    let mut alice = connect(&n1, "alice").await;

    hub.set_publish_delay(Some(Duration::from_secs(60)));
    send(&mut alice, &hello("stuck")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = tokio::time::Instant::now();
    let result = n1.shutdown(Duration::from_millis(200)).await;
    assert!(matches!(result, Err(RelayError::ShutdownTimeout { .. })), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(node.state(), NodeState::Stopped);
}

#[tokio::test]
async fn upgrade_requires_a_valid_token() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;

    let resp = reqwest::get(n1.http_url("/ws")).await.unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(resp.text().await.unwrap(), "missing token");

    let resp = reqwest::get(n1.http_url("/ws?token=bogus")).await.unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(resp.text().await.unwrap(), "invalid token");

    let url = format!("{}?token=admin:root", n1.ws_url());
    assert!(connect_async(url).await.is_err());
    assert!(n1.node().registry().is_empty());
}

#[tokio::test]
async fn draining_node_refuses_upgrades() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    n1.node().coordinator().begin().unwrap();

    let resp = reqwest::get(n1.http_url("/ws?token=user:alice")).await;
    // The listener may already be gone; if it still answers it must refuse.
    if let Ok(resp) = resp {
        assert_eq!(resp.status(), 503);
    }
    assert!(n1.node().registry().is_empty());
}

#[tokio::test]
async fn health_counts_connections() {
    let hub = MemoryHub::new();
    let n1 = spawn_node(&hub).await;
    let mut alice = connect(&n1, "alice").await;
    send(&mut alice, &ClientFrame::join("general")).await;
    wait_refcount(&n1, "general", 1).await;

    let body: Value = reqwest::get(n1.http_url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["state"], "running");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["rooms"], 1);
    assert_eq!(body["subscriptions"], 1);
    assert_eq!(body["node_id"], n1.node().node_id().as_str());
}

#[tokio::test]
async fn server_pings_and_responsive_client_survives() {
    let hub = MemoryHub::new();
    let config = ServerConfig {
        ping_interval: Duration::from_millis(50),
        pong_timeout: Duration::from_millis(500),
        ..ServerConfig::default()
    };
    let n1 = spawn_node_with(&hub, config).await;
    let mut alice = connect(&n1, "alice").await;

    let mut pings = 0;
    let until = tokio::time::Instant::now() + Duration::from_millis(800);
    while tokio::time::Instant::now() < until {
        if let Ok(Some(Ok(Message::Ping(_)))) =
            tokio::time::timeout(Duration::from_millis(100), alice.next()).await
        {
            pings += 1;
        }
    }
    assert!(pings >= 3, "got {pings} pings");
    assert_eq!(n1.node().registry().len(), 1);
}

#[tokio::test]
async fn silent_client_is_dropped_after_pong_timeout() {
    let hub = MemoryHub::new();
    let config = ServerConfig {
        ping_interval: Duration::from_millis(50),
        pong_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let n1 = spawn_node_with(&hub, config).await;
    // Never polled, so no pongs go back.
    let _alice = connect(&n1, "alice").await;

    let node = Arc::clone(n1.node());
    eventually("idle client dropped", || {
        let node = Arc::clone(&node);
        async move { node.registry().is_empty() }
    })
    .await;
}

//! WebSocket endpoint integration tests.
//!
//! Serves the signaling router on a random local port with `TestSfuServer`
//! and talks to it with raw `tokio-tungstenite` sockets, so the JSON wire
//! format is exercised end to end.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use common::RoomCode;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sfu_test_utils::{unique_room_code, TestSfuServer};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Helpers
// ============================================================================

async fn open(server: &TestSfuServer) -> Socket {
    let (socket, _) = connect_async(server.ws_url())
        .await
        .expect("Failed to connect to test server");
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket
        .send(Message::Text(frame.to_string()))
        .await
        .expect("Failed to send frame");
}

/// Next text frame as JSON, skipping control frames.
async fn recv(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(RECV_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("server sent invalid JSON");
        }
    }
}

/// Read until the ack for `id`, discarding pushes.
async fn recv_ack(socket: &mut Socket, id: u64) -> Value {
    loop {
        let frame = recv(socket).await;
        if frame["type"] == "ack" && frame["id"] == id {
            return frame["ack"].clone();
        }
    }
}

/// Read until the next push, discarding acks.
async fn recv_push(socket: &mut Socket) -> Value {
    loop {
        let frame = recv(socket).await;
        if frame["type"] == "push" {
            return frame;
        }
    }
}

fn join_frame(id: u64, room: &str, name: &str) -> Value {
    json!({
        "type": "request",
        "id": id,
        "request": {
            "event": "join",
            "payload": { "roomCode": room, "displayName": name }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_join_over_websocket() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;
    let room = unique_room_code();
    let mut socket = open(&server).await;

    send(&mut socket, join_frame(1, &room, "alice")).await;
    let ack = recv_ack(&mut socket, 1).await;

    assert_eq!(ack["ok"], true);
    assert_eq!(ack["response"]["result"], "joined");
    let data = &ack["response"]["data"];
    assert!(data["selfId"].is_string());
    assert_eq!(data["peers"], json!([]));
    assert_eq!(data["existingProducers"], json!([]));
    assert!(data["rtpCapabilities"]["codecs"].is_array());

    let status = server.sfu.registry.get_status().await?;
    assert_eq!(status.room_count, 1);
    assert_eq!(status.peer_count, 1);

    Ok(())
}

#[tokio::test]
async fn test_request_error_carries_code() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;
    let mut socket = open(&server).await;

    // Creating a transport without joining first
    send(
        &mut socket,
        json!({
            "type": "request",
            "id": 9,
            "request": {
                "event": "create-transport",
                "payload": { "roomCode": unique_room_code(), "direction": "send" }
            }
        }),
    )
    .await;
    let ack = recv_ack(&mut socket, 9).await;

    assert_eq!(ack["ok"], false);
    assert!(ack["error"]["code"].is_string());
    assert!(ack["error"]["message"].is_string());
    assert!(ack.get("response").is_none());

    Ok(())
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;
    let room = unique_room_code();
    let mut socket = open(&server).await;

    socket.send(Message::Text("{not json".to_string())).await?;
    send(&mut socket, json!({ "type": "request", "id": 1 })).await;

    send(&mut socket, join_frame(2, &room, "alice")).await;
    let ack = recv_ack(&mut socket, 2).await;
    assert_eq!(ack["ok"], true);

    Ok(())
}

#[tokio::test]
async fn test_socket_close_leaves_room() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;
    let room = unique_room_code();

    let mut alice = open(&server).await;
    send(&mut alice, join_frame(1, &room, "alice")).await;
    let alice_id = recv_ack(&mut alice, 1).await["response"]["data"]["selfId"].clone();

    let mut bob = open(&server).await;
    send(&mut bob, join_frame(1, &room, "bob")).await;
    let ack = recv_ack(&mut bob, 1).await;
    assert_eq!(ack["response"]["data"]["peers"][0]["socketId"], alice_id);

    alice.close(None).await?;

    let push = recv_push(&mut bob).await;
    assert_eq!(push["event"]["event"], "peer-left");
    assert_eq!(push["event"]["payload"]["socketId"], alice_id);
    assert!(push["seq"].is_u64());

    let state = server
        .sfu
        .registry
        .get_room(RoomCode::from(room.as_str()))
        .await?
        .expect("room still has bob")
        .get_state()
        .await?;
    assert_eq!(state.peers.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_unknown_path_is_not_upgraded() -> Result<(), anyhow::Error> {
    let server = TestSfuServer::spawn().await?;
    let result = connect_async(format!("{}/elsewhere", server.url())).await;
    assert!(result.is_err());
    Ok(())
}

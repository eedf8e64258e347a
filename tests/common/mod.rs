// Shared harness for the integration tests: a live host plus a typed
// WebSocket client speaking the signaling protocol.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use lancast::config::HostConfig;
use lancast::coordinator::RoomCoordinator;
use lancast::media::{LoopbackEngine, MediaEngine, SessionDescription};
use lancast::room::{QualityProfile, Room};
use lancast::signaling::SignalMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(2);

/// Fresh coordinator on an ephemeral port, already sharing `screen:0`.
pub async fn start_host() -> (Arc<LoopbackEngine>, Arc<RoomCoordinator>, Room) {
    start_host_with(HostConfig {
        port: 0,
        ..HostConfig::default()
    })
    .await
}

pub async fn start_host_with(
    config: HostConfig,
) -> (Arc<LoopbackEngine>, Arc<RoomCoordinator>, Room) {
    let engine = Arc::new(LoopbackEngine::new());
    let host = RoomCoordinator::new(config, engine.clone() as Arc<dyn MediaEngine>);
    let room = host
        .create_room("screen:0", QualityProfile::default())
        .await
        .unwrap();
    (engine, host, room)
}

pub async fn connect(port: u16, code: &str) -> WsStream {
    let url = format!("ws://127.0.0.1:{port}/ws/{code}");
    let (stream, _) = tokio::time::timeout(WAIT, connect_async(&url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    stream
}

pub async fn send(ws: &mut WsStream, message: &SignalMessage) {
    let json = serde_json::to_string(message).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

pub async fn recv(ws: &mut WsStream) -> SignalMessage {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("receive timed out")
            .expect("socket ended")
            .expect("socket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Reads frames until `want` picks one, skipping everything else.
pub async fn recv_until<T>(
    ws: &mut WsStream,
    mut want: impl FnMut(SignalMessage) -> Option<T>,
) -> T {
    for _ in 0..32 {
        if let Some(found) = want(recv(ws).await) {
            return found;
        }
    }
    panic!("expected message never arrived");
}

/// Joins as `viewer_id` and waits for the acknowledgement.
pub async fn join(ws: &mut WsStream, viewer_id: &str) {
    send(
        ws,
        &SignalMessage::Join {
            viewer_id: Some(viewer_id.to_string()),
            device_info: None,
        },
    )
    .await;
    let assigned = recv_until(ws, |m| match m {
        SignalMessage::Joined { viewer_id, .. } => Some(viewer_id),
        _ => None,
    })
    .await;
    assert_eq!(assigned, viewer_id);
}

pub async fn wait_for_offer(ws: &mut WsStream) -> SessionDescription {
    recv_until(ws, |m| match m {
        SignalMessage::Offer { data, .. } => Some(data),
        _ => None,
    })
    .await
}

// End-to-end signaling tests: real WebSocket clients against a live gateway

mod common;

use common::*;
use futures_util::{SinkExt, StreamExt};
use lancast::config::HostConfig;
use lancast::media::{IceCandidateInit, SdpType, SessionDescription};
use lancast::room::QualityProfile;
use lancast::signaling::SignalMessage;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[tokio::test]
async fn welcome_join_offer_flow() {
    let (engine, host, room) = start_host().await;
    let mut ws = connect(room.port, &room.code).await;

    match recv(&mut ws).await {
        SignalMessage::Welcome {
            room_code,
            connection_id,
        } => {
            assert_eq!(room_code, room.code);
            assert!(!connection_id.is_empty());
        }
        other => panic!("expected welcome, got {other:?}"),
    }

    send(
        &mut ws,
        &SignalMessage::Join {
            viewer_id: Some("alpha".into()),
            device_info: Some("integration test".into()),
        },
    )
    .await;
    let joined = recv(&mut ws).await;
    assert_eq!(
        joined,
        SignalMessage::Joined {
            viewer_id: "alpha".into(),
            room_code: room.code.clone(),
        }
    );

    // The host reacts to the join with the first offer
    let offer = recv_until(&mut ws, |m| match m {
        SignalMessage::Offer {
            sender_id,
            receiver_id,
            data,
        } => {
            assert!(!sender_id.is_empty());
            assert_eq!(receiver_id.as_deref(), Some("alpha"));
            Some(data)
        }
        _ => None,
    })
    .await;
    assert_eq!(offer.kind, SdpType::Offer);
    assert_eq!(engine.peers().len(), 1);

    host.shutdown().await;
}

#[tokio::test]
async fn lowercase_codes_resolve_to_the_same_room() {
    let (_engine, host, room) = start_host().await;

    let mut ws = connect(room.port, &room.code.to_lowercase()).await;
    match recv(&mut ws).await {
        SignalMessage::Welcome { room_code, .. } => assert_eq!(room_code, room.code),
        other => panic!("expected welcome, got {other:?}"),
    }
    join(&mut ws, "alpha").await;

    let stats = host.get_stats().await.unwrap();
    assert_eq!(stats.viewer_count, 1);

    host.shutdown().await;
}

#[tokio::test]
async fn unknown_room_gets_a_distinct_close() {
    let (_engine, host, room) = start_host().await;
    let mut ws = connect(room.port, "ZZ99ZZ").await;

    let frame = tokio::time::timeout(WAIT, ws.next())
        .await
        .expect("close timed out")
        .expect("socket ended")
        .expect("socket error");
    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(u16::from(close.code), 4404);
            assert_eq!(close.reason.as_str(), "room-not-found");
        }
        other => panic!("expected close, got {other:?}"),
    }

    host.shutdown().await;
}

#[tokio::test]
async fn viewer_count_reaches_every_session() {
    let (_engine, host, room) = start_host().await;

    let mut first = connect(room.port, &room.code).await;
    let _ = recv(&mut first).await; // welcome
    join(&mut first, "alpha").await;

    let mut second = connect(room.port, &room.code).await;
    let _ = recv(&mut second).await;
    join(&mut second, "beta").await;

    // Both sessions observe membership reaching two
    for ws in [&mut first, &mut second] {
        recv_until(ws, |m| match m {
            SignalMessage::ViewerCount { count: 2, .. } => Some(()),
            _ => None,
        })
        .await;
    }

    let stats = host.get_stats().await.unwrap();
    assert_eq!(stats.viewer_count, 2);
    assert_eq!(stats.connections.total(), 2);

    host.shutdown().await;
}

#[tokio::test]
async fn answers_and_candidates_reach_the_native_peer() {
    let (engine, host, room) = start_host().await;
    let mut ws = connect(room.port, &room.code).await;
    let _ = recv(&mut ws).await;
    join(&mut ws, "alpha").await;
    wait_for_offer(&mut ws).await;

    send(
        &mut ws,
        &SignalMessage::Answer {
            sender_id: "alpha".into(),
            receiver_id: None,
            data: SessionDescription {
                sdp: "v=0\r\na=answer\r\n".into(),
                kind: SdpType::Answer,
            },
        },
    )
    .await;
    send(
        &mut ws,
        &SignalMessage::IceCandidate {
            sender_id: "alpha".into(),
            receiver_id: None,
            data: IceCandidateInit {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.9 4242 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            },
        },
    )
    .await;

    // The relay crosses two channels before landing on the peer
    let peer = engine.last_peer().unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    while peer.remote_description().is_none() || peer.candidates_added() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "relay never landed on the peer"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(peer.remote_description().unwrap().kind, SdpType::Answer);
    assert_eq!(peer.candidates_added(), 1);

    host.shutdown().await;
}

#[tokio::test]
async fn leave_shrinks_the_count() {
    let (_engine, host, room) = start_host().await;

    let mut first = connect(room.port, &room.code).await;
    let _ = recv(&mut first).await;
    join(&mut first, "alpha").await;

    let mut second = connect(room.port, &room.code).await;
    let _ = recv(&mut second).await;
    join(&mut second, "beta").await;

    recv_until(&mut first, |m| match m {
        SignalMessage::ViewerCount { count: 2, .. } => Some(()),
        _ => None,
    })
    .await;

    send(&mut second, &SignalMessage::Leave).await;

    recv_until(&mut first, |m| match m {
        SignalMessage::ViewerCount { count: 1, .. } => Some(()),
        _ => None,
    })
    .await;
    let stats = host.get_stats().await.unwrap();
    assert_eq!(stats.viewer_count, 1);

    host.shutdown().await;
}

#[tokio::test]
async fn malformed_json_is_reported_not_fatal() {
    let (_engine, host, room) = start_host().await;
    let mut ws = connect(room.port, &room.code).await;
    let _ = recv(&mut ws).await;

    ws.send(Message::Text("{this is not json".into()))
        .await
        .unwrap();
    let code = recv_until(&mut ws, |m| match m {
        SignalMessage::Error { code, .. } => Some(code),
        _ => None,
    })
    .await;
    assert_eq!(code.as_deref(), Some("invalid-message"));

    // The session survives and still accepts a join
    join(&mut ws, "alpha").await;

    host.shutdown().await;
}

#[tokio::test]
async fn signaling_before_join_is_rejected() {
    let (_engine, host, room) = start_host().await;
    let mut ws = connect(room.port, &room.code).await;
    let _ = recv(&mut ws).await;

    send(
        &mut ws,
        &SignalMessage::Answer {
            sender_id: "nobody".into(),
            receiver_id: None,
            data: SessionDescription {
                sdp: "v=0".into(),
                kind: SdpType::Answer,
            },
        },
    )
    .await;
    let (code, message) = recv_until(&mut ws, |m| match m {
        SignalMessage::Error { code, message } => Some((code, message)),
        _ => None,
    })
    .await;
    assert_eq!(code.as_deref(), Some("not-joined"));
    assert!(message.contains("join before signaling"));

    host.shutdown().await;
}

#[tokio::test]
async fn stopping_the_room_closes_sessions() {
    let (_engine, host, room) = start_host().await;
    let mut ws = connect(room.port, &room.code).await;
    let _ = recv(&mut ws).await;
    join(&mut ws, "alpha").await;
    wait_for_offer(&mut ws).await;

    host.stop_room().await.unwrap();

    // Skip whatever was queued; the session must end with the room-closed code
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "close frame never arrived"
        );
        match tokio::time::timeout(WAIT, ws.next()).await {
            Ok(Some(Ok(Message::Close(Some(close))))) => {
                assert_eq!(u16::from(close.code), 1000);
                assert_eq!(close.reason.as_str(), "room-closed");
                break;
            }
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected close, got {other:?}"),
        }
    }

    // The gateway itself is gone with the room
    let url = format!("ws://127.0.0.1:{}/ws/{}", room.port, room.code);
    if let Ok(Ok(_)) = tokio::time::timeout(WAIT, connect_async(&url)).await {
        panic!("gateway still accepting after stop");
    }

    // A fresh share gets a fresh code; the old one stays dead
    let next = host
        .create_room("screen:0", QualityProfile::default())
        .await
        .unwrap();
    assert_ne!(next.code, room.code);
    let mut late = connect(next.port, &room.code).await;
    let frame = tokio::time::timeout(WAIT, late.next())
        .await
        .expect("close timed out")
        .expect("socket ended")
        .expect("socket error");
    match frame {
        Message::Close(Some(close)) => assert_eq!(u16::from(close.code), 4404),
        other => panic!("expected close, got {other:?}"),
    }

    host.shutdown().await;
}

#[tokio::test]
async fn capacity_overflow_is_signaled_to_the_viewer() {
    let (_engine, host, room) = start_host_with(HostConfig {
        port: 0,
        max_viewers: NonZeroUsize::new(1),
        ..HostConfig::default()
    })
    .await;

    let mut first = connect(room.port, &room.code).await;
    let _ = recv(&mut first).await;
    join(&mut first, "alpha").await;
    wait_for_offer(&mut first).await;

    let mut second = connect(room.port, &room.code).await;
    let _ = recv(&mut second).await;
    join(&mut second, "beta").await;
    let code = recv_until(&mut second, |m| match m {
        SignalMessage::Error { code, .. } => Some(code),
        _ => None,
    })
    .await;
    assert_eq!(code.as_deref(), Some("capacity-exceeded"));

    // The room keeps its single admitted viewer
    let stats = host.get_stats().await.unwrap();
    assert_eq!(stats.connections.total(), 1);
    assert_eq!(stats.viewer_count, 1);

    host.shutdown().await;
}

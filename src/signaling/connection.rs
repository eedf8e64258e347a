#![forbid(unsafe_code)]

// WebSocket session handling for room signaling channels

use super::protocol::SignalMessage;
use crate::config::SessionConfig;
use crate::error::{CoreError, CoreResult};
use crate::metrics::ServerMetrics;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;

/// Close sent to every session when its room is stopped.
const CLOSE_ROOM_CLOSED: (u16, &str) = (1000, "room-closed");
/// Close sent on process shutdown.
const CLOSE_SHUTTING_DOWN: (u16, &str) = (1001, "shutting-down");

/// What flows through a session's outbound queue: pre-serialized frames,
/// a protocol-level keepalive ping, or an instruction to close the socket.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Arc<String>),
    Ping,
    Close { code: u16, reason: &'static str },
}

/// Everything a viewer session reports upward to the coordinator.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Joined {
        room_code: String,
        viewer_id: String,
        device_info: Option<String>,
        remote_address: Option<String>,
    },
    Offer {
        room_code: String,
        viewer_id: String,
        description: crate::media::SessionDescription,
    },
    Answer {
        room_code: String,
        viewer_id: String,
        description: crate::media::SessionDescription,
    },
    Candidate {
        room_code: String,
        viewer_id: String,
        candidate: crate::media::IceCandidateInit,
    },
    Left {
        room_code: String,
        viewer_id: String,
    },
}

struct SessionHandle {
    viewer_id: Option<String>,
    tx: mpsc::Sender<Outbound>,
}

#[derive(Default)]
struct RoomSessions {
    /// Keyed by transport-session id.
    sessions: HashMap<String, SessionHandle>,
    /// Cumulative joins over the room's lifetime, including rejoins.
    total_joins: u64,
}

/// Maps viewer identities to live transport sessions, per room.
///
/// Lock ordering: the outer lock is std (never held across await). All sends
/// go through bounded channels with `try_send`, so holding the read lock while
/// fanning out is safe.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<StdRwLock<HashMap<String, RoomSessions>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdRwLock::new(HashMap::new())),
        }
    }

    /// Records a freshly opened session. The room entry is created on demand;
    /// callers only register sessions for rooms that exist.
    pub fn register(&self, code: &str, connection_id: &str, tx: mpsc::Sender<Outbound>) {
        let mut rooms = self.inner.write().unwrap_or_else(|e| e.into_inner());
        rooms.entry(code.to_string()).or_default().sessions.insert(
            connection_id.to_string(),
            SessionHandle {
                viewer_id: None,
                tx,
            },
        );
    }

    /// Binds a viewer identity to a session on `join`. A client-proposed id is
    /// accepted only when no live session in the room already holds it;
    /// otherwise a fresh id is minted.
    pub fn bind_viewer(
        &self,
        code: &str,
        connection_id: &str,
        proposed: Option<&str>,
    ) -> CoreResult<String> {
        let mut rooms = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let room = rooms
            .get_mut(code)
            .ok_or_else(|| CoreError::RoomNotFound(code.to_string()))?;

        let viewer_id = match proposed {
            Some(p)
                if !p.is_empty()
                    && !room
                        .sessions
                        .values()
                        .any(|s| s.viewer_id.as_deref() == Some(p)) =>
            {
                p.to_string()
            }
            _ => Uuid::new_v4().to_string(),
        };

        let session = room
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| CoreError::ConnectionNotFound(connection_id.to_string()))?;
        session.viewer_id = Some(viewer_id.clone());
        room.total_joins += 1;
        Ok(viewer_id)
    }

    /// Drops the viewer binding but keeps the session open (explicit `leave`).
    pub fn clear_viewer(&self, code: &str, connection_id: &str) -> Option<String> {
        let mut rooms = self.inner.write().unwrap_or_else(|e| e.into_inner());
        rooms
            .get_mut(code)?
            .sessions
            .get_mut(connection_id)?
            .viewer_id
            .take()
    }

    /// Removes a session entirely, returning its viewer binding if any.
    pub fn unregister(&self, code: &str, connection_id: &str) -> Option<String> {
        let mut rooms = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let room = rooms.get_mut(code)?;
        room.sessions.remove(connection_id)?.viewer_id
    }

    /// Delivers one message to the session currently bound to `viewer_id`.
    pub fn send_to_viewer(
        &self,
        code: &str,
        viewer_id: &str,
        message: &SignalMessage,
    ) -> CoreResult<()> {
        let json = Arc::new(serde_json::to_string(message)?);
        let rooms = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let room = rooms
            .get(code)
            .ok_or_else(|| CoreError::RoomNotFound(code.to_string()))?;
        let session = room
            .sessions
            .values()
            .find(|s| s.viewer_id.as_deref() == Some(viewer_id))
            .ok_or_else(|| CoreError::ViewerNotFound(viewer_id.to_string()))?;

        match session.tx.try_send(Outbound::Frame(json)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Dropping {} to viewer {}: outbound queue full",
                    message.kind(),
                    viewer_id
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Session for viewer {} already closed", viewer_id);
                Ok(())
            }
        }
    }

    /// Fans one message out to every session in the room. Returns how many
    /// sessions actually accepted it.
    pub fn broadcast(&self, code: &str, message: &SignalMessage) -> CoreResult<usize> {
        let json = Arc::new(serde_json::to_string(message)?);
        let rooms = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(room) = rooms.get(code) else {
            return Ok(0);
        };

        let mut delivered = 0;
        for (connection_id, session) in &room.sessions {
            match session.tx.try_send(Outbound::Frame(json.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Dropping {} to session {}: outbound queue full",
                        message.kind(),
                        connection_id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Session {} already closed", connection_id);
                }
            }
        }
        Ok(delivered)
    }

    /// Broadcasts the room's membership count paired with its cumulative
    /// session total.
    pub fn broadcast_viewer_count(&self, code: &str, live: usize) -> CoreResult<usize> {
        let total = {
            let rooms = self.inner.read().unwrap_or_else(|e| e.into_inner());
            match rooms.get(code) {
                Some(room) => room.total_joins,
                None => return Ok(0),
            }
        };
        self.broadcast(
            code,
            &SignalMessage::ViewerCount {
                count: live as u64,
                total_connections: total,
            },
        )
    }

    /// Tears down every session in a room, asking each socket to close.
    /// Returns how many sessions were told to go.
    pub fn close_room(&self, code: &str) -> usize {
        let room = {
            let mut rooms = self.inner.write().unwrap_or_else(|e| e.into_inner());
            rooms.remove(code)
        };
        let Some(room) = room else {
            return 0;
        };

        let (close_code, reason) = CLOSE_ROOM_CLOSED;
        let mut closed = 0;
        for (connection_id, session) in room.sessions {
            match session.tx.try_send(Outbound::Close {
                code: close_code,
                reason,
            }) {
                Ok(()) => closed += 1,
                Err(_) => debug!("Session {} gone before room close", connection_id),
            }
        }
        closed
    }

    /// Closes every session in every room. Used on process shutdown.
    pub fn close_all(&self) {
        let rooms = {
            let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *map)
        };
        let (close_code, reason) = CLOSE_SHUTTING_DOWN;
        for (_, room) in rooms {
            for (_, session) in room.sessions {
                let _ = session.tx.try_send(Outbound::Close {
                    code: close_code,
                    reason,
                });
            }
        }
    }

    /// (open sessions, sessions with a bound viewer) across all rooms.
    pub fn counts(&self) -> (usize, usize) {
        let rooms = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut open = 0;
        let mut joined = 0;
        for room in rooms.values() {
            open += room.sessions.len();
            joined += room
                .sessions
                .values()
                .filter(|s| s.viewer_id.is_some())
                .count();
        }
        (open, joined)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize a SignalMessage and queue it on this session's outbound channel.
fn send_json(tx: &mpsc::Sender<Outbound>, message: &SignalMessage) -> CoreResult<()> {
    let json = Arc::new(serde_json::to_string(message)?);
    tx.try_send(Outbound::Frame(json))
        .map_err(|e| CoreError::Transport(format!("outbound queue: {e}")))?;
    Ok(())
}

/// Handles a single signaling WebSocket for an existing room.
pub async fn handle_session(
    socket: WebSocket,
    room_code: String,
    remote_address: Option<String>,
    registry: SessionRegistry,
    events: mpsc::Sender<GatewayEvent>,
    metrics: ServerMetrics,
    limits: SessionConfig,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!(
        "New signaling session {} for room {} ({})",
        connection_id,
        room_code,
        remote_address.as_deref().unwrap_or("unknown peer")
    );

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for messages to this viewer
    let (tx, mut rx) = mpsc::channel::<Outbound>(limits.outbound_buffer);
    registry.register(&room_code, &connection_id, tx.clone());

    if let Err(e) = send_json(
        &tx,
        &SignalMessage::Welcome {
            room_code: room_code.clone(),
            connection_id: connection_id.clone(),
        },
    ) {
        warn!("Could not greet session {}: {}", connection_id, e);
    }

    // Task that forwards queued frames onto the socket
    let send_metrics = metrics.clone();
    let send_session = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(json) => {
                    send_metrics.inc_messages_sent();
                    if ws_sender
                        .send(Message::Text((*json).clone().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Outbound::Ping => {
                    if ws_sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        debug!("Send task finished for session {}", send_session);
    });

    // Server-initiated pings. The client's pongs land in the receive loop
    // below, so a viewer that only watches never trips the idle timeout.
    let ping_every = limits.idle_timeout / 3;
    let ping_tx = tx.clone();
    let ping_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_every);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            match ping_tx.try_send(Outbound::Ping) {
                Ok(()) => {}
                // Queue full; drop the round, the next tick retries
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    });

    // The viewer bound to this session once `join` succeeds
    let mut viewer_id: Option<String> = None;

    // Token bucket rate limiter state
    let max_tokens_us = u64::from(limits.rate_limit_burst) * TOKEN_US;
    let refill_per_sec = u64::from(limits.rate_limit_per_sec);
    let mut tokens_us = max_tokens_us;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        // The send task exits after delivering a Close; stop reading then.
        if tx.is_closed() {
            break;
        }

        // Idle timeout: close the session if no message arrives in time
        let msg = match tokio::time::timeout(limits.idle_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for session {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * refill_per_sec).min(max_tokens_us);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for session {}", connection_id);
                        let _ = send_json(
                            &tx,
                            &SignalMessage::from_error(&CoreError::Resource(format!(
                                "rate limit exceeded: max {refill_per_sec} messages/second"
                            ))),
                        );
                    }
                    continue;
                }

                if text.len() > limits.max_message_bytes {
                    warn!(
                        "Session {} sent {} bytes, limit {}",
                        connection_id,
                        text.len(),
                        limits.max_message_bytes
                    );
                    metrics.inc_errors();
                    let _ = send_json(
                        &tx,
                        &SignalMessage::from_error(&CoreError::InvalidMessage(format!(
                            "message exceeds {} bytes",
                            limits.max_message_bytes
                        ))),
                    );
                    continue;
                }

                match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(message) => {
                        let start = Instant::now();
                        let result = handle_viewer_message(
                            &message,
                            &room_code,
                            &connection_id,
                            remote_address.as_deref(),
                            &mut viewer_id,
                            &tx,
                            &registry,
                            &events,
                            &metrics,
                        )
                        .await;
                        metrics.observe_message_handling(start.elapsed());

                        if let Err(e) = result {
                            error!("Error handling {} from {}: {}", message.kind(), connection_id, e);
                            metrics.inc_errors();
                            // If channel is closed, the send task has exited
                            if tx.is_closed() {
                                break;
                            }
                            let _ = send_json(&tx, &SignalMessage::from_error(&e));
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message format from {}: {}", connection_id, e);
                        metrics.inc_errors();
                        let _ = send_json(
                            &tx,
                            &SignalMessage::from_error(&CoreError::InvalidMessage(e.to_string())),
                        );
                    }
                }
            }
            Message::Close(_) => {
                info!("Session {} closed by client", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Arrival already reset the idle timer; replies happen at
                // the protocol layer
            }
            _ => {
                warn!("Unexpected message type from session {}", connection_id);
            }
        }
    }

    // Disconnect without `leave` still counts as departure
    if let Some(viewer) = viewer_id.take() {
        info!(
            "Session {} gone; viewer {} leaving room {}",
            connection_id, viewer, room_code
        );
        metrics.inc_leaves();
        if events
            .send(GatewayEvent::Left {
                room_code: room_code.clone(),
                viewer_id: viewer,
            })
            .await
            .is_err()
        {
            debug!("Coordinator gone during session teardown");
        }
    }

    registry.unregister(&room_code, &connection_id);

    // _conn_guard dropped here → dec connections_active

    // The ping task holds a sender clone; abort it or the send task's
    // channel never drains to None.
    ping_task.abort();
    drop(tx);
    let _ = send_task.await;

    info!("Session handler finished: {}", connection_id);
}

/// Handle a single parsed message from a viewer session.
#[allow(clippy::too_many_arguments)]
async fn handle_viewer_message(
    message: &SignalMessage,
    room_code: &str,
    connection_id: &str,
    remote_address: Option<&str>,
    viewer_id: &mut Option<String>,
    tx: &mpsc::Sender<Outbound>,
    registry: &SessionRegistry,
    events: &mpsc::Sender<GatewayEvent>,
    metrics: &ServerMetrics,
) -> CoreResult<()> {
    match message {
        SignalMessage::Join {
            viewer_id: proposed,
            device_info,
        } => {
            // A repeated join re-acknowledges the existing binding
            if let Some(existing) = viewer_id.as_ref() {
                debug!("Session {} re-joined as {}", connection_id, existing);
                send_json(
                    tx,
                    &SignalMessage::Joined {
                        viewer_id: existing.clone(),
                        room_code: room_code.to_string(),
                    },
                )?;
                return Ok(());
            }

            let assigned = registry.bind_viewer(room_code, connection_id, proposed.as_deref())?;
            *viewer_id = Some(assigned.clone());
            metrics.inc_joins();

            send_json(
                tx,
                &SignalMessage::Joined {
                    viewer_id: assigned.clone(),
                    room_code: room_code.to_string(),
                },
            )?;

            events
                .send(GatewayEvent::Joined {
                    room_code: room_code.to_string(),
                    viewer_id: assigned,
                    device_info: device_info.clone(),
                    remote_address: remote_address.map(str::to_string),
                })
                .await?;
        }

        SignalMessage::Offer { data, .. } => {
            let viewer = joined(viewer_id)?;
            events
                .send(GatewayEvent::Offer {
                    room_code: room_code.to_string(),
                    viewer_id: viewer.to_string(),
                    description: data.clone(),
                })
                .await?;
        }

        SignalMessage::Answer { data, .. } => {
            let viewer = joined(viewer_id)?;
            events
                .send(GatewayEvent::Answer {
                    room_code: room_code.to_string(),
                    viewer_id: viewer.to_string(),
                    description: data.clone(),
                })
                .await?;
        }

        SignalMessage::IceCandidate { data, .. } => {
            let viewer = joined(viewer_id)?;
            events
                .send(GatewayEvent::Candidate {
                    room_code: room_code.to_string(),
                    viewer_id: viewer.to_string(),
                    candidate: data.clone(),
                })
                .await?;
        }

        SignalMessage::Leave => {
            if let Some(viewer) = viewer_id.take() {
                registry.clear_viewer(room_code, connection_id);
                metrics.inc_leaves();
                events
                    .send(GatewayEvent::Left {
                        room_code: room_code.to_string(),
                        viewer_id: viewer,
                    })
                    .await?;
            }
        }

        // Server-originated types have no business arriving from a client
        other => {
            return Err(CoreError::InvalidMessage(format!(
                "unexpected {} from client",
                other.kind()
            )));
        }
    }

    Ok(())
}

fn joined<'a>(viewer_id: &'a Option<String>) -> CoreResult<&'a str> {
    viewer_id.as_deref().ok_or(CoreError::NotJoined)
}

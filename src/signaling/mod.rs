#![forbid(unsafe_code)]

// Signaling module - HTTP endpoints and the per-room WebSocket channel

pub mod connection;
pub mod protocol;

use crate::config::{HostConfig, SessionConfig};
use crate::metrics::ServerMetrics;
use crate::room::{RoomRegistry, normalize_code};
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Path, State,
        ws::{CloseFrame, Message, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

pub use connection::{GatewayEvent, Outbound, SessionRegistry};
pub use protocol::SignalMessage;

use tokio::sync::mpsc;

/// WebSocket close code for connection attempts against unknown room codes.
pub const CLOSE_UNKNOWN_ROOM: u16 = 4404;

/// Signaling gateway state shared across handlers
#[derive(Clone)]
pub struct SignalingServer {
    rooms: Arc<RoomRegistry>,
    registry: SessionRegistry,
    events: mpsc::Sender<GatewayEvent>,
    metrics: ServerMetrics,
    limits: SessionConfig,
    web_root: String,
}

impl SignalingServer {
    pub fn new(
        rooms: Arc<RoomRegistry>,
        registry: SessionRegistry,
        events: mpsc::Sender<GatewayEvent>,
        metrics: ServerMetrics,
        config: &HostConfig,
    ) -> Self {
        Self {
            rooms,
            registry,
            events,
            metrics,
            limits: config.session.clone(),
            web_root: config.web_root.clone(),
        }
    }

    /// Creates the Axum router for the gateway
    pub fn router(self) -> Router {
        let web_root = self.web_root.clone();
        Router::new()
            .route("/ws/{code}", get(ws_handler))
            .route("/room/{code}", get(room_page_handler))
            .route("/api/room/{code}/info", get(room_info_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
            .fallback_service(ServeDir::new(web_root))
    }

    /// Runs the gateway on an already-bound listener until `shutdown` resolves.
    ///
    /// # Errors
    /// Returns an error if the server fails while accepting connections
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!("Signaling gateway listening on {}", addr);

        let app = self
            .router()
            .into_make_service_with_connect_info::<std::net::SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Liveness endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Metrics handler — Prometheus text exposition format.
/// Protected by optional LANCAST_METRICS_TOKEN env var (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Ok(expected) = std::env::var("LANCAST_METRICS_TOKEN") {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms_active = server.rooms.active_count();
    let (_, viewers_active) = server.registry.counts();
    let peers_active = server.rooms.total_viewers();
    let body = server
        .metrics
        .render_prometheus(rooms_active, viewers_active, peers_active);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Viewer entry page. 404 for unknown codes so stale links fail fast.
async fn room_page_handler(
    Path(code): Path<String>,
    State(server): State<SignalingServer>,
) -> Response {
    // Lowercase or padded codes from typed-in URLs still resolve
    let code = normalize_code(&code).unwrap_or(code);
    if server.rooms.lookup(&code).is_none() {
        return (StatusCode::NOT_FOUND, "room not found").into_response();
    }

    let index = std::path::Path::new(&server.web_root).join("index.html");
    match tokio::fs::read_to_string(&index).await {
        Ok(html) => Html(html).into_response(),
        Err(_) => {
            warn!("Viewer bundle missing at {}", index.display());
            Html(format!(
                "<!doctype html><title>lancast</title>\
                 <p>Room {code} is live, but the viewer bundle is not installed.</p>"
            ))
            .into_response()
        }
    }
}

/// Room status for polling clients
async fn room_info_handler(
    Path(code): Path<String>,
    State(server): State<SignalingServer>,
) -> Response {
    let code = normalize_code(&code).unwrap_or(code);
    match server.rooms.lookup(&code) {
        Some(room) => Json(serde_json::json!({
            "roomCode": room.code,
            "isActive": room.is_active,
            "connectedViewers": room.viewer_count(),
            "qualitySettings": room.quality_profile,
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, "room not found").into_response(),
    }
}

/// WebSocket upgrade handler for `/ws/{code}`
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(code): Path<String>,
    ConnectInfo(peer): ConnectInfo<std::net::SocketAddr>,
    State(server): State<SignalingServer>,
) -> Response {
    // Sessions run under the canonical code; malformed input stays unknown
    let code = normalize_code(&code).unwrap_or(code);
    let known = server.rooms.lookup(&code).is_some();

    ws.max_message_size(server.limits.max_message_bytes)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |mut socket| async move {
            if !known {
                // Distinct close signal so clients can tell "no such room"
                // apart from transport trouble
                warn!("Rejecting signaling session for unknown room {}", code);
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_UNKNOWN_ROOM,
                        reason: "room-not-found".into(),
                    })))
                    .await;
                return;
            }

            connection::handle_session(
                socket,
                code,
                Some(peer.to_string()),
                server.registry,
                server.events,
                server.metrics,
                server.limits,
            )
            .await;
        })
}

#![forbid(unsafe_code)]

// Room coordinator - the facade that wires registry, gateway, peers and
// bitrate control into one host lifecycle

use crate::bitrate::BitrateController;
use crate::config::HostConfig;
use crate::error::{CoreError, CoreResult};
use crate::media::{MediaEngine, MediaHandle, SessionDescription, SourceInfo};
use crate::metrics::ServerMetrics;
use crate::peer::{Connection, ConnectionStatus, PeerManager, PeerNotice};
use crate::room::{QualityProfile, Room, RoomRegistry};
use crate::signaling::{GatewayEvent, SessionRegistry, SignalMessage, SignalingServer};
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Ceiling on a single media-engine capture call.
const CAPTURE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
/// How long a stopping gateway gets to drain before it is aborted.
const GATEWAY_STOP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
/// Inbound gateway events queued ahead of the coordinator loop.
const GATEWAY_EVENT_BUFFER: usize = 256;
/// Capacity of the error broadcast stream.
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Live connection tallies, one bucket per non-terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub connecting: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub reconnecting: usize,
    pub error: usize,
}

impl StatusCounts {
    fn add(&mut self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Connecting => self.connecting += 1,
            ConnectionStatus::Connected => self.connected += 1,
            ConnectionStatus::Disconnected => self.disconnected += 1,
            ConnectionStatus::Reconnecting => self.reconnecting += 1,
            ConnectionStatus::Error => self.error += 1,
            ConnectionStatus::Removed => {}
        }
    }

    pub fn total(&self) -> usize {
        self.connecting + self.connected + self.disconnected + self.reconnecting + self.error
    }
}

/// Read-only snapshot of the running share, for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    pub room_code: String,
    pub source_id: String,
    pub port: u16,
    pub uptime_seconds: u64,
    pub quality: QualityProfile,
    pub viewer_count: usize,
    pub connections: StatusCounts,
}

/// Everything that exists only while a room is active.
struct ActiveShare {
    code: String,
    source_id: String,
    capture: MediaHandle,
    gateway_stop: oneshot::Sender<()>,
    gateway_task: tokio::task::JoinHandle<()>,
    port: u16,
    started_at: Instant,
}

/// Composes registry, gateway, peer manager and bitrate control behind one
/// facade. One coordinator runs one share at a time; `create_room` while a
/// room is active fails with `AlreadyActive`.
pub struct RoomCoordinator {
    host_id: String,
    config: HostConfig,
    engine: Arc<dyn MediaEngine>,
    rooms: Arc<RoomRegistry>,
    registry: SessionRegistry,
    peers: Arc<PeerManager>,
    metrics: ServerMetrics,
    gateway_tx: mpsc::Sender<GatewayEvent>,
    errors: broadcast::Sender<String>,
    /// The active share. The lock also serializes create/stop/quality/source
    /// transitions against each other.
    state: Mutex<Option<ActiveShare>>,
    background: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl RoomCoordinator {
    /// Builds the coordinator and starts its background loops. Must be called
    /// from within a Tokio runtime.
    pub fn new(config: HostConfig, engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        Self::with_metrics(config, engine, ServerMetrics::new())
    }

    pub fn with_metrics(
        config: HostConfig,
        engine: Arc<dyn MediaEngine>,
        metrics: ServerMetrics,
    ) -> Arc<Self> {
        let rooms = Arc::new(RoomRegistry::new());
        let registry = SessionRegistry::new();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let peers = Arc::new(PeerManager::new(
            engine.clone(),
            config.ice.clone(),
            config.reconnect.clone(),
            config.max_viewers,
            notice_tx,
            metrics.clone(),
        ));
        let (gateway_tx, gateway_rx) = mpsc::channel(GATEWAY_EVENT_BUFFER);
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        let coordinator = Arc::new(Self {
            host_id: Uuid::new_v4().to_string(),
            config,
            engine,
            rooms,
            registry,
            peers,
            metrics,
            gateway_tx,
            errors,
            state: Mutex::new(None),
            background: StdMutex::new(Vec::new()),
        });
        coordinator.spawn_background(gateway_rx, notice_rx);
        coordinator
    }

    fn spawn_background(
        self: &Arc<Self>,
        gateway_rx: mpsc::Receiver<GatewayEvent>,
        notice_rx: mpsc::UnboundedReceiver<PeerNotice>,
    ) {
        let events = {
            let me = Arc::clone(self);
            tokio::spawn(async move {
                me.run_event_loop(gateway_rx, notice_rx).await;
            })
        };

        let bitrate = tokio::spawn(
            BitrateController::new(
                self.peers.clone(),
                self.rooms.clone(),
                self.config.bitrate.clone(),
                self.metrics.clone(),
            )
            .run(),
        );

        let sweep = {
            let peers = self.peers.clone();
            let policy = self.config.sweep.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(policy.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let evicted = peers.sweep_stale(policy.inactivity_window).await;
                    if evicted > 0 {
                        info!("Swept {} stale connections", evicted);
                    }
                }
            })
        };

        let mut tasks = self.background.lock().unwrap_or_else(|e| e.into_inner());
        tasks.extend([events, bitrate, sweep]);
    }

    /// Capturable screens and windows, straight from the media engine.
    pub async fn list_sources(&self) -> CoreResult<Vec<SourceInfo>> {
        self.engine.list_sources().await
    }

    /// Starts sharing `source_id`: binds the signaling gateway, starts
    /// capture, and registers the room.
    pub async fn create_room(
        &self,
        source_id: &str,
        profile: QualityProfile,
    ) -> CoreResult<Room> {
        let result = self.create_room_inner(source_id, profile).await;
        self.trace_err("creating room", result)
    }

    async fn create_room_inner(
        &self,
        source_id: &str,
        profile: QualityProfile,
    ) -> CoreResult<Room> {
        let mut state = self.state.lock().await;
        if let Some(active) = state.as_ref() {
            return Err(CoreError::AlreadyActive(active.code.clone()));
        }

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port));
        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .map_err(|e| CoreError::Resource(format!("could not bind {bind_addr}: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| CoreError::Resource(format!("no local address: {e}")))?
            .port();

        let capture = self.start_capture(source_id, &profile).await?;

        let room = match self
            .rooms
            .create_room(&self.host_id, profile, self.config.host_ip, port)
        {
            Ok(room) => room,
            Err(e) => {
                let _ = self.engine.stop_capture(&capture).await;
                return Err(e);
            }
        };

        self.peers.set_track(capture.clone());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = SignalingServer::new(
            self.rooms.clone(),
            self.registry.clone(),
            self.gateway_tx.clone(),
            self.metrics.clone(),
            &self.config,
        );
        let errors = self.errors.clone();
        let gateway_task = tokio::spawn(async move {
            if let Err(e) = server
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await
            {
                error!("Signaling gateway failed: {}", e);
                let _ = errors.send(format!("signaling gateway: {e}"));
            }
        });

        self.metrics.inc_rooms_created();
        info!(
            "Room {} sharing {} at http://{}:{}/room/{}",
            room.code, source_id, self.config.host_ip, port, room.code
        );

        *state = Some(ActiveShare {
            code: room.code.clone(),
            source_id: source_id.to_string(),
            capture,
            gateway_stop: stop_tx,
            gateway_task,
            port,
            started_at: Instant::now(),
        });
        Ok(room)
    }

    /// Tears the active share down completely. A no-op when nothing is active.
    /// Safe against in-flight reconnection attempts: removing the connections
    /// bumps the peer epoch, so stale attempts see a dead generation and stop.
    pub async fn stop_room(&self) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(share) = state.take() else {
            debug!("Stop requested with no active room");
            return Ok(());
        };
        let ActiveShare {
            code,
            capture,
            gateway_stop,
            mut gateway_task,
            ..
        } = share;
        info!("Stopping room {}", code);

        let removed = self.peers.remove_all().await;
        debug!("Removed {} peer connections", removed);
        self.peers.clear_track();

        match tokio::time::timeout(CAPTURE_TIMEOUT, self.engine.stop_capture(&capture)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Stopping capture failed: {}", e);
                self.publish_error(format!("stopping capture: {e}"));
            }
            Err(_) => {
                warn!("Stopping capture timed out");
                self.publish_error("stopping capture timed out".to_string());
            }
        }

        let told = self.registry.close_room(&code);
        debug!("Told {} signaling sessions to close", told);

        if let Err(e) = self.rooms.close(&code) {
            debug!("Room {} already evicted: {}", code, e);
        }

        let _ = gateway_stop.send(());
        if tokio::time::timeout(GATEWAY_STOP_TIMEOUT, &mut gateway_task)
            .await
            .is_err()
        {
            warn!("Signaling gateway did not stop in time; aborting it");
            gateway_task.abort();
        }

        info!("Room {} stopped", code);
        Ok(())
    }

    /// Switches the active share to a new quality profile. Capture restarts at
    /// the new settings and the fresh track is swapped onto every live
    /// connection; nothing is torn down.
    pub async fn update_quality(&self, profile: QualityProfile) -> CoreResult<Room> {
        let result = self.update_quality_inner(profile).await;
        self.trace_err("updating quality", result)
    }

    async fn update_quality_inner(&self, profile: QualityProfile) -> CoreResult<Room> {
        let mut state = self.state.lock().await;
        let share = state.as_mut().ok_or(CoreError::NoActiveRoom)?;

        let next = self.start_capture(&share.source_id, &profile).await?;
        let old = std::mem::replace(&mut share.capture, next.clone());
        if let Err(e) = self.engine.stop_capture(&old).await {
            warn!("Stopping previous capture failed: {}", e);
        }

        let swapped = self.peers.replace_track_all(next).await;
        let room = self.rooms.update_profile(&share.code, profile)?;
        info!(
            "Room {} now {} ({} live tracks swapped)",
            share.code,
            profile.label(),
            swapped
        );
        Ok(room)
    }

    /// Points the active share at a different screen or window. The new track
    /// replaces the old one on every live connection in place.
    pub async fn change_source(&self, source_id: &str) -> CoreResult<Room> {
        let result = self.change_source_inner(source_id).await;
        self.trace_err("changing source", result)
    }

    async fn change_source_inner(&self, source_id: &str) -> CoreResult<Room> {
        let mut state = self.state.lock().await;
        let share = state.as_mut().ok_or(CoreError::NoActiveRoom)?;
        let room = self
            .rooms
            .lookup(&share.code)
            .ok_or(CoreError::NoActiveRoom)?;

        let next = self.start_capture(source_id, &room.quality_profile).await?;
        let old = std::mem::replace(&mut share.capture, next.clone());
        share.source_id = source_id.to_string();
        if let Err(e) = self.engine.stop_capture(&old).await {
            warn!("Stopping previous capture failed: {}", e);
        }

        let swapped = self.peers.replace_track_all(next).await;
        info!(
            "Room {} now sharing {} ({} live tracks swapped)",
            share.code, source_id, swapped
        );
        Ok(room)
    }

    /// Kicks one viewer. The connection is removed; membership and the
    /// viewer-count broadcast follow from the removal event.
    pub async fn disconnect_viewer(&self, viewer_id: &str) -> CoreResult<()> {
        let result = self.disconnect_viewer_inner(viewer_id).await;
        self.trace_err("disconnecting viewer", result)
    }

    async fn disconnect_viewer_inner(&self, viewer_id: &str) -> CoreResult<()> {
        let code = {
            let state = self.state.lock().await;
            state
                .as_ref()
                .map(|s| s.code.clone())
                .ok_or(CoreError::NoActiveRoom)?
        };
        let id = self
            .peers
            .find_by_viewer(&code, viewer_id)
            .ok_or_else(|| CoreError::ViewerNotFound(viewer_id.to_string()))?;
        info!("Host disconnecting viewer {} ({})", viewer_id, id);
        self.peers.remove_connection(&id).await
    }

    /// Display snapshot of the running share.
    pub async fn get_stats(&self) -> CoreResult<HostStats> {
        let (code, source_id, port, started_at) = {
            let state = self.state.lock().await;
            let share = state.as_ref().ok_or(CoreError::NoActiveRoom)?;
            (
                share.code.clone(),
                share.source_id.clone(),
                share.port,
                share.started_at,
            )
        };
        let room = self.rooms.lookup(&code).ok_or(CoreError::NoActiveRoom)?;

        let mut connections = StatusCounts::default();
        for conn in self.peers.snapshots().await {
            if conn.room_code == code {
                connections.add(conn.status);
            }
        }

        Ok(HostStats {
            room_code: code,
            source_id,
            port,
            uptime_seconds: started_at.elapsed().as_secs(),
            quality: room.quality_profile,
            viewer_count: room.viewer_count(),
            connections,
        })
    }

    /// The URL viewers open for the active share, with the actually bound port.
    pub async fn join_url(&self) -> CoreResult<String> {
        let state = self.state.lock().await;
        let share = state.as_ref().ok_or(CoreError::NoActiveRoom)?;
        Ok(format!(
            "http://{}:{}/room/{}",
            self.config.host_ip, share.port, share.code
        ))
    }

    /// Room snapshots, one per mutation.
    pub fn subscribe_rooms(&self) -> broadcast::Receiver<Room> {
        self.rooms.subscribe()
    }

    /// Connection snapshots, one per committed change.
    pub fn subscribe_connections(&self) -> broadcast::Receiver<Connection> {
        self.peers.subscribe()
    }

    /// Human-readable error stream, for surfacing in a UI.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.errors.subscribe()
    }

    /// Stops the active share and every background loop. The coordinator is
    /// not usable afterwards.
    pub async fn shutdown(&self) {
        info!("Coordinator shutting down");
        if let Err(e) = self.stop_room().await {
            warn!("Stopping room during shutdown: {}", e);
        }
        self.registry.close_all();
        let tasks: Vec<_> = {
            let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
            background.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
    }

    async fn start_capture(
        &self,
        source_id: &str,
        profile: &QualityProfile,
    ) -> CoreResult<MediaHandle> {
        match tokio::time::timeout(CAPTURE_TIMEOUT, self.engine.start_capture(source_id, profile))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::Resource(format!(
                "capture of {source_id} timed out"
            ))),
        }
    }

    async fn run_event_loop(
        self: Arc<Self>,
        mut gateway_rx: mpsc::Receiver<GatewayEvent>,
        mut notice_rx: mpsc::UnboundedReceiver<PeerNotice>,
    ) {
        loop {
            tokio::select! {
                event = gateway_rx.recv() => match event {
                    Some(event) => self.handle_gateway_event(event).await,
                    None => break,
                },
                notice = notice_rx.recv() => match notice {
                    Some(notice) => self.handle_peer_notice(notice).await,
                    None => break,
                },
            }
        }
        debug!("Coordinator event loop finished");
    }

    async fn handle_gateway_event(self: &Arc<Self>, event: GatewayEvent) {
        match event {
            GatewayEvent::Joined {
                room_code,
                viewer_id,
                device_info,
                remote_address,
            } => {
                if let Err(e) = self
                    .admit_viewer(&room_code, &viewer_id, device_info, remote_address)
                    .await
                {
                    self.fault(&room_code, &viewer_id, "admitting viewer", &e);
                }
            }
            GatewayEvent::Offer {
                room_code,
                viewer_id,
                description,
            } => {
                if let Err(e) = self.on_viewer_offer(&room_code, &viewer_id, &description).await {
                    self.fault(&room_code, &viewer_id, "answering viewer offer", &e);
                }
            }
            GatewayEvent::Answer {
                room_code,
                viewer_id,
                description,
            } => {
                let result = async {
                    let id = self.require_connection(&room_code, &viewer_id)?;
                    self.peers.set_remote_description(&id, &description).await
                }
                .await;
                if let Err(e) = result {
                    self.fault(&room_code, &viewer_id, "applying answer", &e);
                }
            }
            GatewayEvent::Candidate {
                room_code,
                viewer_id,
                candidate,
            } => {
                let result = async {
                    let id = self.require_connection(&room_code, &viewer_id)?;
                    self.peers.add_ice_candidate(&id, &candidate).await
                }
                .await;
                if let Err(e) = result {
                    self.fault(&room_code, &viewer_id, "adding candidate", &e);
                }
            }
            GatewayEvent::Left {
                room_code,
                viewer_id,
            } => {
                if let Some(id) = self.peers.find_by_viewer(&room_code, &viewer_id) {
                    info!("Viewer {} left room {}", viewer_id, room_code);
                    if let Err(e) = self.peers.remove_connection(&id).await {
                        debug!("Removing connection for {} failed: {}", viewer_id, e);
                    }
                }
            }
        }
    }

    async fn handle_peer_notice(&self, notice: PeerNotice) {
        match notice {
            PeerNotice::Offer {
                room_code,
                viewer_id,
                description,
            } => {
                let message = SignalMessage::Offer {
                    sender_id: self.host_id.clone(),
                    receiver_id: Some(viewer_id.clone()),
                    data: description,
                };
                match self.registry.send_to_viewer(&room_code, &viewer_id, &message) {
                    Ok(()) => self.metrics.inc_offers_sent(),
                    Err(e) => debug!("Could not deliver reconnect offer to {}: {}", viewer_id, e),
                }
            }
            PeerNotice::Candidate {
                room_code,
                viewer_id,
                candidate,
            } => {
                let message = SignalMessage::IceCandidate {
                    sender_id: self.host_id.clone(),
                    receiver_id: Some(viewer_id.clone()),
                    data: candidate,
                };
                if let Err(e) = self.registry.send_to_viewer(&room_code, &viewer_id, &message) {
                    debug!("Could not deliver candidate to {}: {}", viewer_id, e);
                }
            }
            PeerNotice::Changed(connection) => {
                if connection.status == ConnectionStatus::Removed {
                    self.sync_membership(&connection.room_code);
                }
            }
        }
    }

    /// A joined viewer gets a peer connection and the first offer.
    async fn admit_viewer(
        self: &Arc<Self>,
        room_code: &str,
        viewer_id: &str,
        device_info: Option<String>,
        remote_address: Option<String>,
    ) -> CoreResult<()> {
        if self.rooms.lookup(room_code).is_none() {
            return Err(CoreError::RoomNotFound(room_code.to_string()));
        }

        // A rejoin replaces the viewer's previous connection
        if let Some(existing) = self.peers.find_by_viewer(room_code, viewer_id) {
            debug!(
                "Viewer {} rejoined; replacing connection {}",
                viewer_id, existing
            );
            self.peers.remove_connection(&existing).await?;
        }

        let connection = self
            .peers
            .create_connection(viewer_id, room_code, device_info, remote_address)
            .await?;
        let offer = self.peers.create_offer(&connection.id).await?;
        self.registry.send_to_viewer(
            room_code,
            viewer_id,
            &SignalMessage::Offer {
                sender_id: self.host_id.clone(),
                receiver_id: Some(viewer_id.to_string()),
                data: offer,
            },
        )?;
        self.metrics.inc_offers_sent();

        self.sync_membership(room_code);
        Ok(())
    }

    async fn on_viewer_offer(
        &self,
        room_code: &str,
        viewer_id: &str,
        description: &SessionDescription,
    ) -> CoreResult<()> {
        let id = self.require_connection(room_code, viewer_id)?;
        self.peers.set_remote_description(&id, description).await?;
        let answer = self.peers.create_answer(&id).await?;
        self.registry.send_to_viewer(
            room_code,
            viewer_id,
            &SignalMessage::Answer {
                sender_id: self.host_id.clone(),
                receiver_id: Some(viewer_id.to_string()),
                data: answer,
            },
        )?;
        Ok(())
    }

    fn require_connection(&self, room_code: &str, viewer_id: &str) -> CoreResult<String> {
        self.peers
            .find_by_viewer(room_code, viewer_id)
            .ok_or_else(|| CoreError::ViewerNotFound(viewer_id.to_string()))
    }

    /// Recomputes the room's viewer set from live connections and broadcasts
    /// the fresh count.
    fn sync_membership(&self, room_code: &str) {
        let viewers = self.peers.viewers_in(room_code);
        let live = viewers.len();
        match self.rooms.update_membership(room_code, viewers) {
            Ok(_) => {
                let _ = self.registry.broadcast_viewer_count(room_code, live);
            }
            // The room is already gone during teardown
            Err(CoreError::RoomNotFound(_)) => {}
            Err(e) => warn!("Membership update for {} failed: {}", room_code, e),
        }
    }

    /// Surfaces a per-viewer failure: logs it, publishes it on the error
    /// stream, and signals the viewer when their session is still reachable.
    fn fault(&self, room_code: &str, viewer_id: &str, context: &str, err: &CoreError) {
        warn!(
            "{} for viewer {} in {}: {}",
            context, viewer_id, room_code, err
        );
        self.publish_error(format!("{context} for viewer {viewer_id}: {err}"));
        let _ = self
            .registry
            .send_to_viewer(room_code, viewer_id, &SignalMessage::from_error(err));
    }

    fn trace_err<T>(&self, context: &str, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(e) = &result {
            self.publish_error(format!("{context}: {e}"));
        }
        result
    }

    fn publish_error(&self, message: String) {
        // Err just means nobody is subscribed right now
        let _ = self.errors.send(message);
    }
}

#![forbid(unsafe_code)]

// Peer connection manager - one native peer connection per viewer, host side

pub mod state;

pub use state::ConnectionStatus;

use crate::config::{IceConfig, ReconnectPolicy};
use crate::error::{CoreError, CoreResult};
use crate::media::{
    IceCandidateInit, MediaEngine, MediaHandle, PeerEvent, PeerHandle, SessionDescription,
    TransportStats,
};
use crate::metrics::ServerMetrics;
use state::status_for_transport;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

/// Capacity of the connection-snapshot broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// One host-to-viewer peer connection as the rest of the system sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    /// Derived from room code, viewer id and creation instant.
    pub id: String,
    pub viewer_id: String,
    pub room_code: String,
    pub connected_at: SystemTime,
    pub status: ConnectionStatus,
    pub device_info: Option<String>,
    pub remote_address: Option<String>,
    pub latency_ms: Option<u64>,
    pub bandwidth_bps: Option<u64>,
}

/// Signaling and lifecycle output of the manager, consumed by the coordinator.
#[derive(Debug)]
pub enum PeerNotice {
    /// A fresh offer produced by a reconnection attempt, to relay to the viewer.
    Offer {
        room_code: String,
        viewer_id: String,
        description: SessionDescription,
    },
    /// A locally gathered ICE candidate, to relay to the viewer.
    Candidate {
        room_code: String,
        viewer_id: String,
        candidate: IceCandidateInit,
    },
    /// Every committed status or link-quality change, including the terminal one.
    Changed(Connection),
}

struct SlotState {
    connection: Connection,
    reconnect_task: Option<tokio::task::JoinHandle<()>>,
    pump_task: Option<tokio::task::JoinHandle<()>>,
}

/// Everything owned for one connection id. The tokio mutex serializes status
/// transitions; identity fields stay outside it because they never change.
struct PeerSlot {
    viewer_id: String,
    room_code: String,
    handle: Arc<dyn PeerHandle>,
    conn: Mutex<SlotState>,
    last_activity: StdMutex<Instant>,
    /// (bytes_sent, packets_sent) seen at the previous stats poll.
    traffic_mark: StdMutex<(u64, u64)>,
}

impl PeerSlot {
    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Moving transport counters count as activity; frozen ones do not.
    fn note_traffic(&self, stats: &TransportStats) {
        let mark = (stats.bytes_sent, stats.packets_sent);
        let mut seen = self.traffic_mark.lock().unwrap_or_else(|e| e.into_inner());
        if *seen != mark {
            *seen = mark;
            drop(seen);
            self.touch();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

/// Host-side manager for all viewer peer connections.
///
/// The outer map lock is std and never held across await. Per-connection work
/// goes through each slot's own tokio mutex, so transitions and reconnection
/// attempts for one id are serialized while different ids proceed in parallel.
pub struct PeerManager {
    engine: Arc<dyn MediaEngine>,
    ice: IceConfig,
    policy: ReconnectPolicy,
    max_viewers: Option<NonZeroUsize>,
    slots: StdRwLock<HashMap<String, Arc<PeerSlot>>>,
    notices: mpsc::UnboundedSender<PeerNotice>,
    updates: broadcast::Sender<Connection>,
    /// Bumped when a room is torn down; stale reconnection work checks it
    /// and silently no-ops.
    epoch: AtomicU64,
    current_track: StdMutex<Option<MediaHandle>>,
    metrics: ServerMetrics,
}

impl PeerManager {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        ice: IceConfig,
        policy: ReconnectPolicy,
        max_viewers: Option<NonZeroUsize>,
        notices: mpsc::UnboundedSender<PeerNotice>,
        metrics: ServerMetrics,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            engine,
            ice,
            policy,
            max_viewers,
            slots: StdRwLock::new(HashMap::new()),
            notices,
            updates,
            epoch: AtomicU64::new(0),
            current_track: StdMutex::new(None),
            metrics,
        }
    }

    /// Subscribe to connection snapshots. Every committed change is published.
    pub fn subscribe(&self) -> broadcast::Receiver<Connection> {
        self.updates.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Track newly attached to future connections, and the target of
    /// `replace_track_all`.
    pub fn set_track(&self, media: MediaHandle) {
        *self.current_track.lock().unwrap_or_else(|e| e.into_inner()) = Some(media);
    }

    pub fn clear_track(&self) {
        *self.current_track.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn track(&self) -> Option<MediaHandle> {
        self.current_track
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn active_count(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// The live connection id for a viewer, if one exists.
    pub fn find_by_viewer(&self, room_code: &str, viewer_id: &str) -> Option<String> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .find(|(_, slot)| slot.room_code == room_code && slot.viewer_id == viewer_id)
            .map(|(id, _)| id.clone())
    }

    /// Viewers with a live connection in the given room.
    pub fn viewers_in(&self, room_code: &str) -> HashSet<String> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .values()
            .filter(|slot| slot.room_code == room_code)
            .map(|slot| slot.viewer_id.clone())
            .collect()
    }

    fn get_opt(&self, id: &str) -> Option<Arc<PeerSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    fn get(&self, id: &str) -> CoreResult<Arc<PeerSlot>> {
        self.get_opt(id)
            .ok_or_else(|| CoreError::ConnectionNotFound(id.to_string()))
    }

    /// Creates the native peer connection for a viewer and starts tracking it.
    pub async fn create_connection(
        self: &Arc<Self>,
        viewer_id: &str,
        room_code: &str,
        device_info: Option<String>,
        remote_address: Option<String>,
    ) -> CoreResult<Connection> {
        if let Some(max) = self.max_viewers {
            let current = self.active_count();
            if current >= max.get() {
                return Err(CoreError::CapacityExceeded {
                    current,
                    max: max.get(),
                });
            }
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let id = format!("{room_code}-{viewer_id}-{nanos:x}");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = self.engine.create_peer(&self.ice, events_tx).await?;

        if let Some(track) = self.track() {
            if let Err(e) = handle.attach_track(&track).await {
                let _ = handle.close().await;
                return Err(e);
            }
        }

        let connection = Connection {
            id: id.clone(),
            viewer_id: viewer_id.to_string(),
            room_code: room_code.to_string(),
            connected_at: SystemTime::now(),
            status: ConnectionStatus::Connecting,
            device_info,
            remote_address,
            latency_ms: None,
            bandwidth_bps: None,
        };

        let slot = Arc::new(PeerSlot {
            viewer_id: viewer_id.to_string(),
            room_code: room_code.to_string(),
            handle: handle.clone(),
            conn: Mutex::new(SlotState {
                connection: connection.clone(),
                reconnect_task: None,
                pump_task: None,
            }),
            last_activity: StdMutex::new(Instant::now()),
            traffic_mark: StdMutex::new((0, 0)),
        });

        // Re-check the cap under the write lock so racing creations cannot
        // overshoot it. The guard must be gone before the native close below.
        let over_cap = {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            match self.max_viewers {
                Some(max) if slots.len() >= max.get() => Some((slots.len(), max.get())),
                _ => {
                    slots.insert(id.clone(), slot.clone());
                    None
                }
            }
        };
        if let Some((current, max)) = over_cap {
            let _ = handle.close().await;
            return Err(CoreError::CapacityExceeded { current, max });
        }

        let pump = spawn_event_pump(
            Arc::clone(self),
            id.clone(),
            room_code.to_string(),
            viewer_id.to_string(),
            events_rx,
        );
        slot.conn.lock().await.pump_task = Some(pump);

        info!("Created peer connection {} for viewer {}", id, viewer_id);
        self.emit(&connection);
        Ok(connection)
    }

    /// Thin delegations to the native handle. All fail with `ConnectionNotFound`
    /// once the id has been removed.
    pub async fn create_offer(&self, id: &str) -> CoreResult<SessionDescription> {
        let slot = self.get(id)?;
        let offer = slot.handle.create_offer().await?;
        slot.touch();
        Ok(offer)
    }

    pub async fn create_answer(&self, id: &str) -> CoreResult<SessionDescription> {
        let slot = self.get(id)?;
        let answer = slot.handle.create_answer().await?;
        slot.touch();
        Ok(answer)
    }

    pub async fn set_remote_description(
        &self,
        id: &str,
        description: &SessionDescription,
    ) -> CoreResult<()> {
        let slot = self.get(id)?;
        slot.handle.set_remote_description(description).await?;
        slot.touch();
        Ok(())
    }

    pub async fn add_ice_candidate(&self, id: &str, candidate: &IceCandidateInit) -> CoreResult<()> {
        let slot = self.get(id)?;
        slot.handle.add_ice_candidate(candidate).await?;
        slot.touch();
        Ok(())
    }

    /// Stats polls also feed the activity clock: a transport whose counters
    /// advance is not idle, however quiet its signaling channel is.
    pub async fn transport_stats(&self, id: &str) -> CoreResult<TransportStats> {
        let slot = self.get(id)?;
        let stats = slot.handle.stats().await?;
        slot.note_traffic(&stats);
        Ok(stats)
    }

    pub async fn set_target_bitrate(&self, id: &str, bitrate_bps: u64) -> CoreResult<()> {
        let slot = self.get(id)?;
        slot.handle.set_target_bitrate(bitrate_bps).await?;
        slot.touch();
        Ok(())
    }

    /// Records measured link quality on the connection and publishes the
    /// refreshed snapshot.
    pub async fn note_link_quality(
        &self,
        id: &str,
        latency_ms: Option<u64>,
        bandwidth_bps: Option<u64>,
    ) -> CoreResult<Connection> {
        let slot = self.get(id)?;
        let snapshot = {
            let mut st = slot.conn.lock().await;
            st.connection.latency_ms = latency_ms;
            st.connection.bandwidth_bps = bandwidth_bps;
            st.connection.clone()
        };
        self.emit(&snapshot);
        Ok(snapshot)
    }

    pub async fn snapshot(&self, id: &str) -> CoreResult<Connection> {
        let slot = self.get(id)?;
        let st = slot.conn.lock().await;
        Ok(st.connection.clone())
    }

    pub async fn snapshots(&self) -> Vec<Connection> {
        let slots: Vec<Arc<PeerSlot>> = {
            let map = self.slots.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.conn.lock().await.connection.clone());
        }
        out
    }

    /// Swaps the outgoing track on every live connection without renegotiating.
    /// Returns how many handles accepted the new track.
    pub async fn replace_track_all(&self, media: MediaHandle) -> usize {
        self.set_track(media.clone());
        let slots: Vec<Arc<PeerSlot>> = {
            let map = self.slots.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let mut swapped = 0;
        for slot in slots {
            match slot.handle.replace_track(&media).await {
                Ok(()) => swapped += 1,
                Err(e) => warn!(
                    "Track swap failed for viewer {}: {}",
                    slot.viewer_id, e
                ),
            }
        }
        swapped
    }

    /// Explicit removal: closes the handle and walks the status through a
    /// final Disconnected to terminal Removed. Idempotent.
    pub async fn remove_connection(&self, id: &str) -> CoreResult<()> {
        self.remove_inner(id, true).await
    }

    /// Tears down every connection and invalidates in-flight reconnection work.
    pub async fn remove_all(&self) -> usize {
        self.epoch.fetch_add(1, Ordering::Relaxed);
        let ids = self.connection_ids();
        for id in &ids {
            let _ = self.remove_connection(id).await;
        }
        ids.len()
    }

    /// Evicts connections with no transport activity inside `window`.
    pub async fn sweep_stale(&self, window: Duration) -> usize {
        let stale: Vec<String> = {
            let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
            slots
                .iter()
                .filter(|(_, slot)| slot.idle_for() > window)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &stale {
            warn!("Evicting silent connection {}", id);
            let _ = self.remove_connection(id).await;
        }
        stale.len()
    }

    async fn remove_inner(&self, id: &str, abort_reconnect: bool) -> CoreResult<()> {
        let slot = {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            match slots.remove(id) {
                Some(slot) => slot,
                None => return Ok(()), // already gone
            }
        };

        let mut snapshots = Vec::with_capacity(2);
        {
            let mut st = slot.conn.lock().await;
            if let Some(task) = st.pump_task.take() {
                task.abort();
            }
            match st.reconnect_task.take() {
                // The exhaustion path runs inside the reconnect task itself;
                // dropping the handle detaches it instead of cancelling us.
                Some(task) if abort_reconnect => task.abort(),
                _ => {}
            }

            // Every exit ends with Disconnected then Removed on the stream
            if !st.connection.status.is_terminal() {
                if st.connection.status != ConnectionStatus::Disconnected {
                    if let Ok(next) = st.connection.status.step(ConnectionStatus::Disconnected) {
                        st.connection.status = next;
                        snapshots.push(st.connection.clone());
                    }
                }
                if let Ok(next) = st.connection.status.step(ConnectionStatus::Removed) {
                    st.connection.status = next;
                    snapshots.push(st.connection.clone());
                }
            }
        }

        if let Err(e) = slot.handle.close().await {
            debug!("Native close for {} reported: {}", id, e);
        }

        for snap in &snapshots {
            self.emit(snap);
        }
        self.metrics.inc_peers_removed();
        info!("Removed peer connection {}", id);
        Ok(())
    }

    /// Applies a validated status change. `Ok(None)` means the status was
    /// already there and nothing was emitted.
    async fn apply_status(
        &self,
        id: &str,
        next: ConnectionStatus,
    ) -> CoreResult<Option<Connection>> {
        let slot = self.get(id)?;
        let snapshot = {
            let mut st = slot.conn.lock().await;
            if st.connection.status == next {
                return Ok(None);
            }
            let stepped = st.connection.status.step(next)?;
            st.connection.status = stepped;
            if stepped == ConnectionStatus::Connected {
                // A live transport cancels any remaining reconnection attempt
                if let Some(task) = st.reconnect_task.take() {
                    task.abort();
                }
            }
            st.connection.clone()
        };
        slot.touch();
        self.emit(&snapshot);
        Ok(Some(snapshot))
    }

    /// Routes a native transport callback into the status machine.
    async fn on_transport_state(
        self: &Arc<Self>,
        id: &str,
        state: crate::media::TransportState,
    ) {
        let Some(next) = status_for_transport(state) else {
            if let Some(slot) = self.get_opt(id) {
                slot.touch();
            }
            return;
        };

        match self.apply_status(id, next).await {
            Ok(Some(_)) => {
                if next.needs_reconnect() {
                    self.ensure_reconnect(id).await;
                }
            }
            Ok(None) => {}
            Err(CoreError::ConnectionNotFound(_)) => {}
            Err(e) => debug!("Ignoring transport callback for {}: {}", id, e),
        }
    }

    /// Starts the reconnection driver for a connection unless one is already
    /// running.
    async fn ensure_reconnect(self: &Arc<Self>, id: &str) {
        let Some(slot) = self.get_opt(id) else { return };
        let mut st = slot.conn.lock().await;
        if st.connection.status.is_terminal() {
            return;
        }
        if let Some(task) = &st.reconnect_task {
            if !task.is_finished() {
                return;
            }
        }

        let manager = Arc::clone(self);
        let id = id.to_string();
        let epoch = self.epoch();
        st.reconnect_task = Some(tokio::spawn(async move {
            manager.run_reconnect(id, epoch).await;
        }));
    }

    /// One bounded reconnection loop for one connection. Serialized against
    /// other transitions through the slot mutex; cancelled by a Connected
    /// callback or by removal.
    async fn run_reconnect(&self, id: String, epoch: u64) {
        let max_attempts = self.policy.max_attempts;
        for attempt in 1..=max_attempts {
            tokio::time::sleep(self.policy.backoff).await;

            if self.epoch() != epoch {
                debug!("Reconnect for {} abandoned: room torn down", id);
                return;
            }
            let Some(slot) = self.get_opt(&id) else { return };

            let snapshot = {
                let mut st = slot.conn.lock().await;
                let status = st.connection.status;
                match status {
                    ConnectionStatus::Connected | ConnectionStatus::Removed => return,
                    // Native stack is mid-handshake; give it the round
                    ConnectionStatus::Connecting => continue,
                    ConnectionStatus::Reconnecting => None,
                    ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                        match status.step(ConnectionStatus::Reconnecting) {
                            Ok(next) => {
                                st.connection.status = next;
                                Some(st.connection.clone())
                            }
                            Err(_) => return,
                        }
                    }
                }
            };
            if let Some(snap) = &snapshot {
                self.emit(snap);
            }

            self.metrics.inc_reconnect_attempts();
            info!(
                "Reconnection attempt {}/{} for {}",
                attempt, max_attempts, id
            );

            let result = async {
                if let Some(track) = self.track() {
                    slot.handle.attach_track(&track).await?;
                }
                slot.handle.restart_ice().await?;
                slot.handle.create_offer().await
            }
            .await;

            match result {
                Ok(offer) => {
                    slot.touch();
                    let _ = self.notices.send(PeerNotice::Offer {
                        room_code: slot.room_code.clone(),
                        viewer_id: slot.viewer_id.clone(),
                        description: offer,
                    });
                }
                Err(e) => {
                    warn!("Reconnection attempt {} for {} failed: {}", attempt, id, e);
                    if let Err(e) = self.apply_status(&id, ConnectionStatus::Error).await {
                        debug!("Could not mark {} errored: {}", id, e);
                    }
                }
            }
        }

        warn!(
            "Giving up on {} after {} reconnection attempts",
            id, max_attempts
        );
        // Running inside the reconnect task; it must not abort itself
        let _ = self.remove_inner(&id, false).await;
    }

    fn emit(&self, snapshot: &Connection) {
        // Err just means nobody is subscribed right now
        let _ = self.updates.send(snapshot.clone());
        let _ = self.notices.send(PeerNotice::Changed(snapshot.clone()));
    }
}

fn spawn_event_pump(
    manager: Arc<PeerManager>,
    connection_id: String,
    room_code: String,
    viewer_id: String,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::StateChanged(state) => {
                    debug!("Transport {} reported {}", connection_id, state);
                    manager.on_transport_state(&connection_id, state).await;
                }
                PeerEvent::LocalCandidate(candidate) => {
                    if let Some(slot) = manager.get_opt(&connection_id) {
                        slot.touch();
                    }
                    let _ = manager.notices.send(PeerNotice::Candidate {
                        room_code: room_code.clone(),
                        viewer_id: viewer_id.clone(),
                        candidate,
                    });
                }
            }
        }
        debug!("Event pump finished for {}", connection_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LoopbackEngine, TransportState};
    use crate::room::QualityProfile;

    fn policy(max_attempts: u32, backoff_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    fn manager(
        engine: &Arc<LoopbackEngine>,
        policy: ReconnectPolicy,
        max_viewers: Option<NonZeroUsize>,
    ) -> (Arc<PeerManager>, mpsc::UnboundedReceiver<PeerNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mgr = PeerManager::new(
            engine.clone() as Arc<dyn MediaEngine>,
            IceConfig::default(),
            policy,
            max_viewers,
            tx,
            ServerMetrics::new(),
        );
        (Arc::new(mgr), rx)
    }

    async fn next_change(rx: &mut mpsc::UnboundedReceiver<PeerNotice>) -> Connection {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for a peer notice")
                .expect("notice channel closed");
            if let PeerNotice::Changed(connection) = notice {
                return connection;
            }
        }
    }

    #[tokio::test]
    async fn creation_attaches_track_and_respects_the_cap() {
        let engine = Arc::new(LoopbackEngine::new());
        let (mgr, mut rx) = manager(&engine, policy(3, 10), NonZeroUsize::new(1));

        let track = engine
            .start_capture("screen:0", &QualityProfile::default())
            .await
            .unwrap();
        mgr.set_track(track.clone());

        let conn = mgr
            .create_connection("alpha", "AB12CD", Some("Firefox".into()), None)
            .await
            .unwrap();
        assert_eq!(conn.status, ConnectionStatus::Connecting);
        assert!(conn.id.starts_with("AB12CD-alpha-"));
        assert_eq!(next_change(&mut rx).await.status, ConnectionStatus::Connecting);

        let peer = engine.last_peer().unwrap();
        assert_eq!(peer.current_track().unwrap().source_id, track.source_id);

        let err = mgr
            .create_connection("beta", "AB12CD", None, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::CapacityExceeded { current: 1, max: 1 }
        ));
        // The rejected join left no native peer behind
        assert_eq!(engine.peers().len(), 1);
        assert_eq!(mgr.active_count(), 1);
        assert_eq!(
            mgr.find_by_viewer("AB12CD", "alpha").as_deref(),
            Some(conn.id.as_str())
        );
    }

    #[tokio::test]
    async fn transport_callbacks_drive_the_status() {
        let engine = Arc::new(LoopbackEngine::new());
        let (mgr, mut rx) = manager(&engine, policy(3, 5_000), None);

        mgr.create_connection("alpha", "AB12CD", None, None)
            .await
            .unwrap();
        next_change(&mut rx).await; // Connecting

        let peer = engine.last_peer().unwrap();
        peer.emit_state(TransportState::Connected);
        assert_eq!(next_change(&mut rx).await.status, ConnectionStatus::Connected);

        // Repeated callbacks with the same state emit nothing further
        peer.emit_state(TransportState::Connected);
        peer.emit_state(TransportState::Disconnected);
        assert_eq!(
            next_change(&mut rx).await.status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn exhausted_reconnects_end_in_removal() {
        let engine = Arc::new(LoopbackEngine::new());
        let (mgr, mut rx) = manager(&engine, policy(2, 10), None);

        let conn = mgr
            .create_connection("alpha", "AB12CD", None, None)
            .await
            .unwrap();
        next_change(&mut rx).await; // Connecting

        let peer = engine.last_peer().unwrap();
        peer.set_fail_restarts(true);
        peer.emit_state(TransportState::Failed);

        // Error, then Reconnecting/Error per attempt, then terminal Removed
        assert_eq!(next_change(&mut rx).await.status, ConnectionStatus::Error);
        let mut saw_reconnecting = false;
        let final_status = loop {
            let snap = next_change(&mut rx).await;
            match snap.status {
                ConnectionStatus::Reconnecting => saw_reconnecting = true,
                ConnectionStatus::Removed => break snap.status,
                _ => {}
            }
        };
        assert!(saw_reconnecting);
        assert_eq!(final_status, ConnectionStatus::Removed);
        assert_eq!(mgr.active_count(), 0);
        assert!(peer.is_closed());
        assert!(matches!(
            mgr.snapshot(&conn.id).await.unwrap_err(),
            CoreError::ConnectionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn exhaustion_mid_handshake_exits_through_disconnected() {
        let engine = Arc::new(LoopbackEngine::new());
        let (mgr, mut rx) = manager(&engine, policy(2, 20), None);

        mgr.create_connection("alpha", "AB12CD", None, None)
            .await
            .unwrap();
        next_change(&mut rx).await; // Connecting

        let peer = engine.last_peer().unwrap();
        peer.emit_state(TransportState::Connected);
        peer.emit_state(TransportState::Disconnected);
        // The native stack opens a fresh handshake and stalls in it, so every
        // scheduled attempt yields its round until the budget runs out
        peer.emit_state(TransportState::Connecting);

        let mut statuses = Vec::new();
        loop {
            let snap = next_change(&mut rx).await;
            statuses.push(snap.status);
            if snap.status == ConnectionStatus::Removed {
                break;
            }
        }
        // The terminal pair is always Disconnected then Removed, never a
        // jump straight out of the handshake
        let n = statuses.len();
        assert_eq!(statuses[n - 2], ConnectionStatus::Disconnected, "{statuses:?}");
        assert_eq!(statuses[n - 1], ConnectionStatus::Removed);
        assert_eq!(mgr.active_count(), 0);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn reaching_connected_cancels_the_pending_attempt() {
        let engine = Arc::new(LoopbackEngine::new());
        let (mgr, mut rx) = manager(&engine, policy(5, 300), None);

        let conn = mgr
            .create_connection("alpha", "AB12CD", None, None)
            .await
            .unwrap();
        next_change(&mut rx).await; // Connecting

        let peer = engine.last_peer().unwrap();
        peer.emit_state(TransportState::Failed);
        assert_eq!(next_change(&mut rx).await.status, ConnectionStatus::Error);

        // The driver is sleeping its backoff; recovery cancels it
        peer.emit_state(TransportState::Connected);
        assert_eq!(next_change(&mut rx).await.status, ConnectionStatus::Connected);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err(), "no further transitions expected");
        assert_eq!(
            mgr.snapshot(&conn.id).await.unwrap().status,
            ConnectionStatus::Connected
        );
        assert_eq!(peer.ice_restarts(), 0);
    }

    #[tokio::test]
    async fn reconnect_attempt_restarts_ice_and_reoffers() {
        let engine = Arc::new(LoopbackEngine::new());
        let (mgr, mut rx) = manager(&engine, policy(5, 10), None);

        mgr.create_connection("alpha", "AB12CD", None, None)
            .await
            .unwrap();
        next_change(&mut rx).await; // Connecting

        let peer = engine.last_peer().unwrap();
        peer.emit_state(TransportState::Disconnected);
        assert_eq!(
            next_change(&mut rx).await.status,
            ConnectionStatus::Disconnected
        );
        assert_eq!(
            next_change(&mut rx).await.status,
            ConnectionStatus::Reconnecting
        );

        // The attempt produces a fresh offer notice for the coordinator
        let offer = loop {
            let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            if let PeerNotice::Offer {
                viewer_id,
                description,
                ..
            } = notice
            {
                assert_eq!(viewer_id, "alpha");
                break description;
            }
        };
        assert_eq!(offer.kind, crate::media::SdpType::Offer);
        assert!(peer.ice_restarts() >= 1);

        peer.emit_state(TransportState::Connected);
        loop {
            if next_change(&mut rx).await.status == ConnectionStatus::Connected {
                break;
            }
        }
    }

    #[tokio::test]
    async fn removal_is_idempotent_and_ends_disconnected_then_removed() {
        let engine = Arc::new(LoopbackEngine::new());
        let (mgr, mut rx) = manager(&engine, policy(3, 5_000), None);

        let conn = mgr
            .create_connection("alpha", "AB12CD", None, None)
            .await
            .unwrap();
        next_change(&mut rx).await; // Connecting

        mgr.remove_connection(&conn.id).await.unwrap();
        assert_eq!(
            next_change(&mut rx).await.status,
            ConnectionStatus::Disconnected
        );
        assert_eq!(next_change(&mut rx).await.status, ConnectionStatus::Removed);
        assert!(engine.last_peer().unwrap().is_closed());

        mgr.remove_connection(&conn.id).await.unwrap();
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn track_swap_reaches_every_live_handle() {
        let engine = Arc::new(LoopbackEngine::new());
        let (mgr, _rx) = manager(&engine, policy(3, 5_000), None);

        let first = engine
            .start_capture("screen:0", &QualityProfile::default())
            .await
            .unwrap();
        mgr.set_track(first);
        mgr.create_connection("alpha", "AB12CD", None, None)
            .await
            .unwrap();
        mgr.create_connection("beta", "AB12CD", None, None)
            .await
            .unwrap();

        let second = engine
            .start_capture("window:7", &QualityProfile::default())
            .await
            .unwrap();
        let swapped = mgr.replace_track_all(second.clone()).await;
        assert_eq!(swapped, 2);
        for peer in engine.peers() {
            assert_eq!(peer.current_track().unwrap().source_id, "window:7");
        }
    }

    #[tokio::test]
    async fn sweep_evicts_silent_connections() {
        let engine = Arc::new(LoopbackEngine::new());
        let (mgr, _rx) = manager(&engine, policy(3, 5_000), None);

        mgr.create_connection("alpha", "AB12CD", None, None)
            .await
            .unwrap();
        assert_eq!(mgr.sweep_stale(Duration::from_secs(60)).await, 0);
        assert_eq!(mgr.sweep_stale(Duration::ZERO).await, 1);
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn sweep_spares_transports_with_moving_counters() {
        let engine = Arc::new(LoopbackEngine::new());
        let (mgr, _rx) = manager(&engine, policy(3, 5_000), None);

        let conn = mgr
            .create_connection("alpha", "AB12CD", None, None)
            .await
            .unwrap();
        let peer = engine.last_peer().unwrap();
        let window = Duration::from_millis(100);

        // Counters advance between polls: the viewer stays, however quiet
        // the signaling channel is
        for round in 1..=3u64 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            peer.set_stats(TransportStats {
                bytes_sent: round * 50_000,
                packets_sent: round * 100,
                ..TransportStats::default()
            });
            mgr.transport_stats(&conn.id).await.unwrap();
            assert_eq!(mgr.sweep_stale(window).await, 0, "round {round}");
        }

        // Frozen counters stop counting as activity
        tokio::time::sleep(Duration::from_millis(150)).await;
        mgr.transport_stats(&conn.id).await.unwrap();
        assert_eq!(mgr.sweep_stale(window).await, 1);
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn remove_all_invalidates_pending_reconnects() {
        let engine = Arc::new(LoopbackEngine::new());
        let (mgr, mut rx) = manager(&engine, policy(5, 30), None);

        mgr.create_connection("alpha", "AB12CD", None, None)
            .await
            .unwrap();
        next_change(&mut rx).await; // Connecting

        let peer = engine.last_peer().unwrap();
        peer.set_fail_restarts(true);
        peer.emit_state(TransportState::Failed);
        assert_eq!(next_change(&mut rx).await.status, ConnectionStatus::Error);

        let epoch_before = mgr.epoch();
        assert_eq!(mgr.remove_all().await, 1);
        assert_eq!(mgr.epoch(), epoch_before + 1);
        assert_eq!(mgr.active_count(), 0);

        // Give any stale driver a chance to misbehave; it must not
        tokio::time::sleep(Duration::from_millis(150)).await;
        while let Ok(notice) = rx.try_recv() {
            if let PeerNotice::Changed(c) = notice {
                assert!(
                    c.status == ConnectionStatus::Disconnected
                        || c.status == ConnectionStatus::Removed
                );
            }
        }
    }
}

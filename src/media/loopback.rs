#![forbid(unsafe_code)]

// Loopback media engine - mints handles and records every instruction without
// touching real capture or network. Backs the headless binary and the tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::IceConfig;
use crate::error::{CoreError, CoreResult};
use crate::media::{
    IceCandidateInit, MediaEngine, MediaHandle, PeerEvent, PeerHandle, SdpType,
    SessionDescription, SourceInfo, SourceKind, TransportState, TransportStats,
};
use crate::room::QualityProfile;

pub struct LoopbackEngine {
    sources: Vec<SourceInfo>,
    captures: Mutex<Vec<MediaHandle>>,
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
    fail_captures: AtomicBool,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self {
            sources: vec![
                SourceInfo {
                    id: "screen:0".to_string(),
                    name: "Primary Display".to_string(),
                    kind: SourceKind::Screen,
                },
                SourceInfo {
                    id: "window:7".to_string(),
                    name: "Terminal".to_string(),
                    kind: SourceKind::Window,
                },
            ],
            captures: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            fail_captures: AtomicBool::new(false),
        }
    }

    /// Makes the next `start_capture` calls fail, for exercising error paths.
    pub fn set_fail_captures(&self, fail: bool) {
        self.fail_captures.store(fail, Ordering::Relaxed);
    }

    pub fn active_captures(&self) -> usize {
        self.captures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Every peer created so far, in creation order.
    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last_peer(&self) -> Option<Arc<LoopbackPeer>> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn list_sources(&self) -> CoreResult<Vec<SourceInfo>> {
        Ok(self.sources.clone())
    }

    async fn start_capture(
        &self,
        source_id: &str,
        _profile: &QualityProfile,
    ) -> CoreResult<MediaHandle> {
        if self.fail_captures.load(Ordering::Relaxed) {
            return Err(CoreError::Resource("capture unavailable".into()));
        }
        if !self.sources.iter().any(|s| s.id == source_id) {
            return Err(CoreError::Resource(format!("unknown source: {source_id}")));
        }
        let handle = MediaHandle {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
        };
        self.captures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle.clone());
        Ok(handle)
    }

    async fn stop_capture(&self, handle: &MediaHandle) -> CoreResult<()> {
        self.captures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|h| h.id != handle.id);
        Ok(())
    }

    async fn create_peer(
        &self,
        _ice: &IceConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> CoreResult<Arc<dyn PeerHandle>> {
        let peer = Arc::new(LoopbackPeer::new(events));
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(peer.clone());
        Ok(peer)
    }
}

/// A fake native peer connection. Tests drive its transport states through
/// `emit_state` and read back what the core instructed it to do.
pub struct LoopbackPeer {
    id: String,
    events: mpsc::UnboundedSender<PeerEvent>,
    track: Mutex<Option<MediaHandle>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidateInit>>,
    offers: AtomicUsize,
    ice_restarts: AtomicUsize,
    target_bitrate: AtomicU64,
    stats: Mutex<TransportStats>,
    closed: AtomicBool,
    fail_restarts: AtomicBool,
}

impl LoopbackPeer {
    fn new(events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            events,
            track: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            ice_restarts: AtomicUsize::new(0),
            target_bitrate: AtomicU64::new(0),
            stats: Mutex::new(TransportStats::default()),
            closed: AtomicBool::new(false),
            fail_restarts: AtomicBool::new(false),
        }
    }

    /// Pushes a transport state change, as the native layer would.
    pub fn emit_state(&self, state: TransportState) {
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }

    /// Pushes a locally gathered ICE candidate.
    pub fn emit_candidate(&self, candidate: IceCandidateInit) {
        let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = stats;
    }

    /// Makes `restart_ice` fail, so reconnection attempts burn out on their own.
    pub fn set_fail_restarts(&self, fail: bool) {
        self.fail_restarts.store(fail, Ordering::Relaxed);
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::Relaxed)
    }

    pub fn ice_restarts(&self) -> usize {
        self.ice_restarts.load(Ordering::Relaxed)
    }

    pub fn target_bitrate(&self) -> u64 {
        self.target_bitrate.load(Ordering::Relaxed)
    }

    pub fn current_track(&self) -> Option<MediaHandle> {
        self.track.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn candidates_added(&self) -> usize {
        self.candidates.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(CoreError::Transport("peer connection closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerHandle for LoopbackPeer {
    async fn attach_track(&self, media: &MediaHandle) -> CoreResult<()> {
        self.ensure_open()?;
        *self.track.lock().unwrap_or_else(|e| e.into_inner()) = Some(media.clone());
        Ok(())
    }

    async fn replace_track(&self, media: &MediaHandle) -> CoreResult<()> {
        self.ensure_open()?;
        *self.track.lock().unwrap_or_else(|e| e.into_inner()) = Some(media.clone());
        Ok(())
    }

    async fn create_offer(&self) -> CoreResult<SessionDescription> {
        self.ensure_open()?;
        let n = self.offers.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SessionDescription {
            sdp: format!("v=0\r\no=- {} {} IN IP4 0.0.0.0\r\ns=-\r\n", self.id, n),
            kind: SdpType::Offer,
        })
    }

    async fn create_answer(&self) -> CoreResult<SessionDescription> {
        self.ensure_open()?;
        if self
            .remote
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
        {
            return Err(CoreError::Transport("no remote offer to answer".into()));
        }
        Ok(SessionDescription {
            sdp: format!("v=0\r\no=- {} answer IN IP4 0.0.0.0\r\ns=-\r\n", self.id),
            kind: SdpType::Answer,
        })
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> CoreResult<()> {
        self.ensure_open()?;
        *self.remote.lock().unwrap_or_else(|e| e.into_inner()) = Some(desc.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> CoreResult<()> {
        self.ensure_open()?;
        self.candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(candidate.clone());
        Ok(())
    }

    async fn restart_ice(&self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.fail_restarts.load(Ordering::Relaxed) {
            return Err(CoreError::Transport("ice restart refused".into()));
        }
        self.ice_restarts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn set_target_bitrate(&self, bitrate_bps: u64) -> CoreResult<()> {
        self.ensure_open()?;
        self.target_bitrate.store(bitrate_bps, Ordering::Relaxed);
        Ok(())
    }

    async fn stats(&self) -> CoreResult<TransportStats> {
        self.ensure_open()?;
        Ok(self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn close(&self) -> CoreResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

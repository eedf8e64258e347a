#![forbid(unsafe_code)]

// Media engine seam - capture sources, native peer connections, transport stats
// The engine itself (capture + encode + RTP) lives outside this crate; the core
// drives it through these traits.

pub mod loopback;

pub use loopback::LoopbackEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::IceConfig;
use crate::error::CoreResult;
use crate::room::QualityProfile;

/// Kind of capturable source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Screen,
    Window,
}

/// One entry from the engine's source enumeration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
}

/// Opaque token for a live capture session, minted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: String,
    pub source_id: String,
}

/// SDP payload direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as carried on offer/answer messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpType,
}

/// An ICE candidate in the shape browsers produce and consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

/// Native transport state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Counters sampled from one native peer connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub round_trip_time_seconds: f64,
    pub fps: f64,
}

/// Events a native peer connection pushes back to its owner.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged(TransportState),
    LocalCandidate(IceCandidateInit),
}

/// The capture/encode/transport engine the core orchestrates.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Enumerates capturable screens and windows.
    async fn list_sources(&self) -> CoreResult<Vec<SourceInfo>>;

    /// Starts capturing the given source at the given profile.
    async fn start_capture(
        &self,
        source_id: &str,
        profile: &QualityProfile,
    ) -> CoreResult<MediaHandle>;

    /// Stops a capture session. Idempotent.
    async fn stop_capture(&self, handle: &MediaHandle) -> CoreResult<()>;

    /// Creates one native peer connection. State changes and locally gathered
    /// ICE candidates arrive on `events`.
    async fn create_peer(
        &self,
        ice: &IceConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> CoreResult<std::sync::Arc<dyn PeerHandle>>;
}

/// One native peer connection, host side.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Adds the capture's outgoing track to this connection. Idempotent.
    async fn attach_track(&self, media: &MediaHandle) -> CoreResult<()>;

    /// Swaps the outgoing track in place, without renegotiation.
    async fn replace_track(&self, media: &MediaHandle) -> CoreResult<()>;

    async fn create_offer(&self) -> CoreResult<SessionDescription>;

    /// Builds an answer to a previously applied remote offer.
    async fn create_answer(&self) -> CoreResult<SessionDescription>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> CoreResult<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidateInit) -> CoreResult<()>;

    /// Restarts ICE gathering on the existing connection.
    async fn restart_ice(&self) -> CoreResult<()>;

    /// Instructs the encoder to aim for the given bitrate.
    async fn set_target_bitrate(&self, bitrate_bps: u64) -> CoreResult<()>;

    async fn stats(&self) -> CoreResult<TransportStats>;

    /// Tears the native connection down. Idempotent.
    async fn close(&self) -> CoreResult<()>;
}

#![forbid(unsafe_code)]

// Signaling protocol - the JSON messages exchanged over the room WebSocket

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::media::{IceCandidateInit, SessionDescription};

/// Every message that travels over a signaling socket, either direction.
///
/// Offers, answers and candidates are relayed verbatim: `sender_id` names the
/// originator, `receiver_id` the target. An absent `receiver_id` means "to the
/// host" on viewer-originated messages and "broadcast to the room" on
/// host-originated ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// First message on every freshly opened socket.
    #[serde(rename_all = "camelCase")]
    Welcome {
        room_code: String,
        connection_id: String,
    },
    /// Viewer requests room membership.
    #[serde(rename_all = "camelCase")]
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewer_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_info: Option<String>,
    },
    /// Acknowledges a join with the final viewer id.
    #[serde(rename_all = "camelCase")]
    Joined {
        viewer_id: String,
        room_code: String,
    },
    /// Session description offer.
    #[serde(rename_all = "camelCase")]
    Offer {
        sender_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_id: Option<String>,
        data: SessionDescription,
    },
    /// Session description answer.
    #[serde(rename_all = "camelCase")]
    Answer {
        sender_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_id: Option<String>,
        data: SessionDescription,
    },
    /// Trickled ICE candidate.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        sender_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_id: Option<String>,
        data: IceCandidateInit,
    },
    /// Viewer announces departure.
    Leave,
    /// Live membership count, broadcast to the whole room on every change.
    #[serde(rename_all = "camelCase")]
    ViewerCount {
        count: u64,
        total_connections: u64,
    },
    /// Error surfaced to one session.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
}

impl SignalMessage {
    /// Wire error carrying the taxonomy's stable code.
    pub fn from_error(err: &CoreError) -> Self {
        Self::Error {
            code: Some(err.code().to_string()),
            message: err.to_string(),
        }
    }

    /// The wire tag, for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Join { .. } => "join",
            Self::Joined { .. } => "joined",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Leave => "leave",
            Self::ViewerCount { .. } => "viewer-count",
            Self::Error { .. } => "error",
        }
    }
}

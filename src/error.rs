#![forbid(unsafe_code)]

// Error taxonomy shared across the orchestration core

use thiserror::Error;

/// The canonical error type for the orchestration core.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Validation ───────────────────────────────────────────────
    /// A room code failed the 6-char uppercase alphanumeric shape check.
    #[error("invalid room code: {0:?}")]
    InvalidRoomCode(String),

    /// An inbound signaling message could not be parsed or was out of place.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A session tried to signal without having joined first.
    #[error("join before signaling")]
    NotJoined,

    // ── Lookup ───────────────────────────────────────────────────
    /// No active room with this code.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// No live connection with this id.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// No connection belonging to this viewer.
    #[error("viewer not found: {0}")]
    ViewerNotFound(String),

    // ── Capacity ─────────────────────────────────────────────────
    /// The configured concurrent-viewer cap is already reached.
    #[error("viewer capacity reached: {current} of {max}")]
    CapacityExceeded { current: usize, max: usize },

    // ── Transport ────────────────────────────────────────────────
    /// The native peer connection reported a negotiation or media failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// A connection status change violated the state machine.
    #[error("invalid status transition: {0}")]
    InvalidTransition(&'static str),

    // ── Resources ────────────────────────────────────────────────
    /// Capture, address, or port acquisition failed.
    #[error("resource error: {0}")]
    Resource(String),

    /// Code generation kept colliding with active rooms.
    #[error("room code space exhausted after {0} attempts")]
    CodeSpaceExhausted(usize),

    /// The underlying socket or listener failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    // ── Facade preconditions ─────────────────────────────────────
    /// `create_room` was called while a room is already active.
    #[error("a room is already active: {0}")]
    AlreadyActive(String),

    /// The operation requires an active room and there is none.
    #[error("no active room")]
    NoActiveRoom,

    // ── Plumbing ─────────────────────────────────────────────────
    /// A channel to another component was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Stable machine-readable code carried on wire-level `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRoomCode(_) | Self::InvalidMessage(_) => "invalid-message",
            Self::NotJoined => "not-joined",
            Self::RoomNotFound(_) => "room-not-found",
            Self::ConnectionNotFound(_) | Self::ViewerNotFound(_) => "not-found",
            Self::CapacityExceeded { .. } => "capacity-exceeded",
            Self::Transport(_) | Self::InvalidTransition(_) => "transport-error",
            Self::Resource(_) | Self::CodeSpaceExhausted(_) | Self::Io(_) => "resource-error",
            Self::AlreadyActive(_) => "already-active",
            Self::NoActiveRoom => "no-active-room",
            Self::ChannelClosed | Self::Serialization(_) => "internal-error",
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CoreError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        CoreError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = CoreError::CapacityExceeded { current: 4, max: 4 };
        assert!(e.to_string().contains("4 of 4"));

        let e = CoreError::RoomNotFound("ABC123".into());
        assert!(e.to_string().contains("ABC123"));
    }

    #[test]
    fn wire_codes_are_distinct_for_join_failures() {
        let cap = CoreError::CapacityExceeded { current: 1, max: 1 };
        let missing = CoreError::RoomNotFound("XYZXYZ".into());
        assert_eq!(cap.code(), "capacity-exceeded");
        assert_eq!(missing.code(), "room-not-found");
        assert_ne!(cap.code(), missing.code());
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let e: CoreError = io_err.into();
        assert!(matches!(e, CoreError::Io(_)));
        assert_eq!(e.code(), "resource-error");
    }
}

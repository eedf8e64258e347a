#![forbid(unsafe_code)]

// Per-viewer connection status machine

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::media::TransportState;

/// Status of one host-to-viewer peer connection.
///
/// ```text
///                    ┌─────────────┐
///   createConnection │  Connecting │◄───────────────┐
///                    └──────┬──────┘                │
///                           │ connected             │ ice restart
///                    ┌──────▼──────┐                │
///              ┌─────►  Connected  │         ┌──────┴───────┐
///              │     └──────┬──────┘    ┌────► Reconnecting │
///              │            │ drop/fail │    └──────┬───────┘
///              │     ┌──────▼──────┐    │           │ attempts
///              └─────┤Disconnected/├────┘           │ exhausted
///        reconnected │    Error    │         ┌──────▼──────┐
///                    └──────┬──────┘         │   Removed   │
///                           └────────────────►  (terminal) │
///                                            └─────────────┘
/// ```
///
/// `Reconnecting` is only reachable from `Disconnected` or `Error`, and
/// `Removed` only from `Disconnected`, `Error`, or `Reconnecting`. Nothing
/// leaves `Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
    Removed,
}

impl ConnectionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Removed => "removed",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed)
    }

    /// States that demand a reconnection attempt.
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    fn allows(&self, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        if *self == to {
            return false;
        }
        match (*self, to) {
            (Removed, _) => false,
            // Reconnection only starts after the transport actually dropped
            (Connecting | Connected, Reconnecting) => false,
            // Teardown goes through Disconnected first; no shortcut out of a
            // live or pending transport
            (Connecting | Connected, Removed) => false,
            _ => true,
        }
    }

    /// Validated transition. Same-state is rejected so callers skip no-ops
    /// explicitly instead of emitting duplicate events.
    pub fn step(self, to: ConnectionStatus) -> CoreResult<ConnectionStatus> {
        if self.allows(to) {
            Ok(to)
        } else if self == to {
            Err(CoreError::InvalidTransition("status unchanged"))
        } else if self.is_terminal() {
            Err(CoreError::InvalidTransition("connection already removed"))
        } else if to == ConnectionStatus::Removed {
            Err(CoreError::InvalidTransition(
                "removal follows a drop or failure",
            ))
        } else {
            Err(CoreError::InvalidTransition(
                "reconnecting requires a dropped transport",
            ))
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Maps a native transport state onto a connection status. `None` means the
/// callback carries no status change worth recording (fresh handles, and the
/// close we initiated ourselves during removal).
pub fn status_for_transport(state: TransportState) -> Option<ConnectionStatus> {
    match state {
        TransportState::New | TransportState::Closed => None,
        TransportState::Connecting => Some(ConnectionStatus::Connecting),
        TransportState::Connected => Some(ConnectionStatus::Connected),
        TransportState::Disconnected => Some(ConnectionStatus::Disconnected),
        TransportState::Failed => Some(ConnectionStatus::Error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    #[test]
    fn happy_path_reaches_connected() {
        let status = Connecting.step(Connected).unwrap();
        assert_eq!(status, Connected);
        assert!(!status.is_terminal());
        assert!(!status.needs_reconnect());
    }

    #[test]
    fn failure_walks_through_reconnecting_to_removed() {
        let status = Connected.step(Error).unwrap();
        assert!(status.needs_reconnect());
        let status = status.step(Reconnecting).unwrap();
        let status = status.step(Error).unwrap();
        let status = status.step(Reconnecting).unwrap();
        let status = status.step(Removed).unwrap();
        assert!(status.is_terminal());
    }

    #[test]
    fn reconnecting_needs_a_dropped_transport() {
        assert!(Connecting.step(Reconnecting).is_err());
        assert!(Connected.step(Reconnecting).is_err());
        assert!(Disconnected.step(Reconnecting).is_ok());
        assert!(Error.step(Reconnecting).is_ok());
    }

    #[test]
    fn removal_requires_a_dropped_transport() {
        assert!(Connecting.step(Removed).is_err());
        assert!(Connected.step(Removed).is_err());
        assert!(Disconnected.step(Removed).is_ok());
        assert!(Error.step(Removed).is_ok());
        assert!(Reconnecting.step(Removed).is_ok());
    }

    #[test]
    fn nothing_leaves_removed() {
        for to in [Connecting, Connected, Disconnected, Reconnecting, Error] {
            assert!(Removed.step(to).is_err(), "removed must not reach {to}");
        }
    }

    #[test]
    fn same_state_is_rejected() {
        assert!(matches!(
            Connected.step(Connected),
            Err(CoreError::InvalidTransition(_))
        ));
    }

    #[test]
    fn transport_states_map_onto_statuses() {
        assert_eq!(
            status_for_transport(TransportState::Connected),
            Some(Connected)
        );
        assert_eq!(status_for_transport(TransportState::Failed), Some(Error));
        assert_eq!(
            status_for_transport(TransportState::Disconnected),
            Some(Disconnected)
        );
        assert_eq!(status_for_transport(TransportState::New), None);
        assert_eq!(status_for_transport(TransportState::Closed), None);
    }
}

//! Stream finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy.  Transitions are driven by [`crate::connection`]; this module only
//! names the states and answers questions about them.
//!
//! ```text
//!  UNCONNECTED ──connect()──▶ CONNECTING ──(immediate)──▶ CONNECTED
//!       │                                                     │
//!       │                                  end() / peer END   │
//!       │                                                     ▼
//!       └───────── destroy() ──────────▶ DESTROYED ◀──────  CLOSING
//!                                         (terminal)   both ENDs acked
//! ```
//!
//! Pre-connect acceptance is not a state of its own: an `Unconnected` stream
//! that has an accepted remote candidate is in PRECONNECT mode (see
//! [`crate::connection::Connection::is_preconnect`]).

use std::fmt;

/// All possible states of the stream FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Created, no remote identity bound yet.
    #[default]
    Unconnected,
    /// Remote identity bound; reachability not yet confirmed.
    ///
    /// No handshake is performed, so a stream only passes through this state
    /// inside `connect`.
    Connecting,
    /// Both directions open.
    Connected,
    /// At least one direction has been half-closed.
    Closing,
    /// Terminal.  Nothing is sent or delivered any more.
    Destroyed,
}

impl StreamState {
    /// `true` once the remote identity is bound and until destruction.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Closing)
    }

    pub fn is_destroyed(self) -> bool {
        self == Self::Destroyed
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unconnected() {
        assert_eq!(StreamState::default(), StreamState::Unconnected);
    }

    #[test]
    fn connected_states() {
        assert!(!StreamState::Unconnected.is_connected());
        assert!(StreamState::Connected.is_connected());
        assert!(StreamState::Closing.is_connected());
        assert!(!StreamState::Destroyed.is_connected());
        assert!(StreamState::Destroyed.is_destroyed());
    }
}

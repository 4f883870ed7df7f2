//! Error taxonomy shared by the protocol engine and the host-facing handles.
//!
//! Errors fall into a handful of classes:
//! - **Protocol** violations (malformed frames) are dropped by the socket and
//!   only ever show up in logs or in direct calls to the codec.
//! - **State** violations are returned synchronously to the caller that
//!   issued the invalid operation.
//! - **Reset**, **resource** and **timeout** errors destroy the affected
//!   stream and are delivered as a [`crate::stream::StreamEvent::Error`]
//!   followed by a close notification.
//! - **Callback faults** are reported on the socket's event channel.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::packet::PacketError;
use crate::state::StreamState;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A bounded resource that a stream can run out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Frames buffered ahead of the expected sequence number.
    ReorderBuffer,
    /// Bytes written but not yet handed to the socket.
    SendBuffer,
    /// Reliable messages awaiting acknowledgement.
    MessageQueue,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReorderBuffer => write!(f, "reorder buffer"),
            Self::SendBuffer => write!(f, "send buffer"),
            Self::MessageQueue => write!(f, "message queue"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A datagram could not be decoded into a frame.
    #[error("protocol violation: {0}")]
    Protocol(#[from] PacketError),

    /// The operation is not valid in the stream's current state.
    #[error("cannot {operation} a stream in state {state}")]
    StateViolation {
        state: StreamState,
        operation: &'static str,
    },

    /// The peer destroyed the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("{0} exhausted")]
    ResourceExhausted(Resource),

    /// A user-supplied callback panicked.
    #[error("callback fault: {0}")]
    CallbackFault(String),

    /// The oldest unacknowledged frame was retransmitted too many times.
    #[error("no acknowledgement after {retries} retransmissions")]
    Timeout { retries: u32 },

    #[error("message of {len} bytes exceeds the {max} byte frame limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("local id {0} is already registered on this socket")]
    DuplicateId(u32),

    #[error("stream is closed")]
    StreamClosed,

    #[error("socket is not bound")]
    SocketNotBound,

    #[error("socket is already bound")]
    AlreadyBound,

    #[error("socket is closed")]
    SocketClosed,

    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// Reason supplied by the host to [`crate::stream::Stream::destroy_with`].
    #[error("stream aborted: {0}")]
    Aborted(String),

    /// A [`crate::Config`] value the engine cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The dispatch loop is gone (runtime shut down).
    #[error("transport engine stopped")]
    EngineStopped,
}

impl Error {
    /// `true` for errors caused by the peer tearing the connection down.
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::ConnectionReset)
    }

    /// errno-style code for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "EPROTO",
            Self::StateViolation { .. } => "ERR_ASSERTION",
            Self::ConnectionReset => "ECONNRESET",
            Self::ResourceExhausted(_) => "ENOBUFS",
            Self::CallbackFault(_) => "ERR_CALLBACK",
            Self::Timeout { .. } => "ETIMEDOUT",
            Self::MessageTooLarge { .. } => "EMSGSIZE",
            Self::DuplicateId(_) => "EADDRINUSE",
            Self::StreamClosed | Self::SocketClosed => "ECLOSED",
            Self::SocketNotBound => "ENOTCONN",
            Self::AlreadyBound | Self::InvalidConfig(_) => "EINVAL",
            Self::Io(_) => "EIO",
            Self::Aborted(_) => "ECONNABORTED",
            Self::EngineStopped => "ESHUTDOWN",
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_is_reset_class() {
        assert!(Error::ConnectionReset.is_reset());
        assert_eq!(Error::ConnectionReset.code(), "ECONNRESET");
        assert!(!Error::StreamClosed.is_reset());
    }

    #[test]
    fn state_violation_message_names_state() {
        let err = Error::StateViolation {
            state: StreamState::Unconnected,
            operation: "write",
        };
        assert_eq!(err.to_string(), "cannot write a stream in state Unconnected");
        assert_eq!(err.code(), "ERR_ASSERTION");
    }

    #[test]
    fn io_error_converts() {
        let err: Error = io::Error::new(io::ErrorKind::AddrInUse, "taken").into();
        assert_eq!(err.code(), "EIO");
        assert!(err.to_string().contains("taken"));
    }
}

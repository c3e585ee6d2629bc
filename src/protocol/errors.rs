//! Protocol-layer error types.

use thiserror::Error;

use super::session::SessionState;

/// Errors raised while moving frames across a byte stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Reading from or writing to the underlying channel failed.
    #[error("transport I/O error: {reason}")]
    Io { reason: String },

    /// The transport was closed, locally or by a previous failure.
    #[error("transport closed")]
    Closed,

    /// An outbound message could not be serialized.
    #[error("failed to serialize message: {reason}")]
    Serialize { reason: String },
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io {
            reason: e.to_string(),
        }
    }
}

/// Errors raised by the session state machine or message decoding.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// A frame was not a valid JSON-RPC 2.0 message.
    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    /// An operation was attempted before the session reached `Ready`.
    #[error("'{operation}' is not permitted while the session is {state}")]
    Sequencing {
        operation: String,
        state: SessionState,
    },

    /// The session was asked to move along an edge that does not exist.
    #[error("invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

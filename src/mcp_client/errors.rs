//! MCP Client error types.

use thiserror::Error;

use crate::protocol::errors::{ProtocolError, TransportError as FrameError};
use crate::protocol::session::SessionState;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// A connection with this name is already live.
    #[error("server '{name}' is already connected")]
    DuplicateServer { name: String },

    /// No connection with this name.
    #[error("unknown server: '{name}'")]
    UnknownServer { name: String },

    /// Framing or I/O failure on a server's channel.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The server sent something that breaks the protocol.
    #[error("protocol violation from server '{server}': {reason}")]
    ProtocolViolation { server: String, reason: String },

    /// An operation was attempted before the handshake finished or after
    /// the connection left `Ready`.
    #[error("server '{server}' cannot {operation} while {state}")]
    NotReady {
        server: String,
        operation: String,
        state: SessionState,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The connection ended while a request was outstanding.
    #[error("connection to server '{server}' closed: {reason}")]
    ConnectionClosed { server: String, reason: String },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// The connector is shutting down and no longer accepts calls.
    #[error("client is shutting down")]
    ShuttingDown,
}

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The byte channel failed or closed.
    Transport,
    /// The peer broke the protocol, or a call was made out of sequence.
    Protocol,
    /// A call waited longer than its deadline.
    Timeout,
    /// The server answered with an error, or the caller sent bad arguments.
    Request,
    /// Process startup, configuration, or connector bookkeeping.
    Setup,
}

impl McpError {
    pub fn kind(&self) -> FaultKind {
        match self {
            McpError::TransportError { .. } | McpError::ConnectionClosed { .. } => {
                FaultKind::Transport
            }
            McpError::ProtocolViolation { .. } | McpError::NotReady { .. } => FaultKind::Protocol,
            McpError::Timeout { .. } => FaultKind::Timeout,
            McpError::ServerError { .. } | McpError::InvalidArguments { .. } => FaultKind::Request,
            McpError::SpawnFailed { .. }
            | McpError::InitFailed { .. }
            | McpError::DuplicateServer { .. }
            | McpError::UnknownServer { .. }
            | McpError::ConfigError { .. }
            | McpError::ShuttingDown => FaultKind::Setup,
        }
    }

    /// Whether the failure took the whole connection down, not just one call.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. }
                | McpError::ConnectionClosed { .. }
                | McpError::ProtocolViolation { .. }
        )
    }

    pub(crate) fn transport(server: &str, e: FrameError) -> Self {
        match e {
            FrameError::Closed => McpError::ConnectionClosed {
                server: server.to_string(),
                reason: "transport closed".into(),
            },
            other => McpError::TransportError {
                server: server.to_string(),
                reason: other.to_string(),
            },
        }
    }

    pub(crate) fn protocol(server: &str, e: ProtocolError) -> Self {
        match e {
            ProtocolError::Sequencing { operation, state } => McpError::NotReady {
                server: server.to_string(),
                operation,
                state,
            },
            other => McpError::ProtocolViolation {
                server: server.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

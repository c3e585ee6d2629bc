//! Per-connection handshake state machine.
//!
//! ```text
//! Connecting -> Initializing -> Ready -> Closing -> Closed
//!      \______________\____________\________\_____> Errored
//! ```
//!
//! `Errored` and `Closed` are terminal. Any non-terminal state may also move
//! straight to `Closing`, so a connection that is torn down mid-handshake
//! still releases its transport the normal way.

use std::fmt;

use super::errors::ProtocolError;

/// Lifecycle state of one protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Initializing,
    Ready,
    Closing,
    Closed,
    Errored,
}

impl SessionState {
    /// `Closed` and `Errored` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }

    /// Whether the edge `self -> next` exists.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed | Errored, _) => false,
            (_, Errored) => true,
            (Connecting, Initializing) => true,
            (Initializing, Ready) => true,
            (Connecting | Initializing | Ready, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Handshake state for one connection.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    failure: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A fresh session in `Connecting`.
    pub fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Why the session entered `Errored`, if it did.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// `Connecting -> Initializing`.
    pub fn begin_handshake(&mut self) -> Result<(), ProtocolError> {
        self.transition(SessionState::Initializing)
    }

    /// `Initializing -> Ready`.
    pub fn complete_handshake(&mut self) -> Result<(), ProtocolError> {
        self.transition(SessionState::Ready)
    }

    /// Enter `Closing`. Returns `false` if the session is already closing or
    /// terminal, in which case nothing changes.
    pub fn begin_close(&mut self) -> bool {
        if self.state.can_transition_to(SessionState::Closing) {
            self.state = SessionState::Closing;
            true
        } else {
            false
        }
    }

    /// `Closing -> Closed`. A no-op from a terminal state.
    pub fn finish_close(&mut self) -> Result<(), ProtocolError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.transition(SessionState::Closed)
    }

    /// Move to `Errored`. Returns `false` if the session was already terminal.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Errored;
        self.failure = Some(reason.into());
        true
    }

    /// Reject `operation` unless the session is `Ready`.
    pub fn ensure_ready(&self, operation: &str) -> Result<(), ProtocolError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ProtocolError::Sequencing {
                operation: operation.to_string(),
                state: self.state,
            })
        }
    }

    fn transition(&mut self, next: SessionState) -> Result<(), ProtocolError> {
        if !self.state.can_transition_to(next) {
            return Err(ProtocolError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

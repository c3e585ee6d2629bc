//! Client-side configuration and status types.
//!
//! Wire types live in [`crate::protocol::types`]; this module holds what the
//! connector itself needs: how to launch a server, how long to wait, and
//! what a connection looks like from the outside.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::session::SessionState;

/// Default per-call timeout (ms).
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;

/// Default bound on the initialize handshake plus first discovery (ms).
///
/// Generous because some servers load large dependencies before answering.
pub const DEFAULT_INIT_TIMEOUT_MS: u64 = 30_000;

/// Default time `close` waits for in-flight calls before cancelling them (ms).
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// How to launch one server process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the child. Inherits ours when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Top-level `mcp-servers.json` document.
///
/// ```json
/// { "mcpServers": { "time": { "command": "time-server", "args": [] } } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServersConfig {
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// Connector timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectorSettings {
    pub call_timeout_ms: u64,
    pub init_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl ConnectorSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Snapshot of one connection, for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: String,
    pub tool_count: usize,
    /// Why the connection failed, when `state` is `errored`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ServerStatus {
    pub(crate) fn new(
        name: &str,
        state: SessionState,
        tool_count: usize,
        failure: Option<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            state: state.to_string(),
            tool_count,
            failure,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! toolbridge: tool invocation over the Model Context Protocol.
//!
//! - [`protocol`]: JSON-RPC framing, wire types, and the session state machine
//! - [`mcp_server`]: tool registry, dispatcher, and stdio host for servers
//! - [`mcp_client`]: a connector that drives many servers at once
//! - [`logging`]: tracing setup shared by the binaries

pub mod logging;
pub mod mcp_client;
pub mod mcp_server;
pub mod protocol;

use std::path::PathBuf;

pub use mcp_client::{McpClient, McpError};
pub use mcp_server::{Dispatcher, ServerHost, ToolRegistry};

/// Return the platform-standard data directory for toolbridge.
///
/// - macOS: `~/Library/Application Support/toolbridge/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolbridge\`
/// - Linux: `$XDG_DATA_HOME/toolbridge/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolbridge/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolbridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolbridge")
}

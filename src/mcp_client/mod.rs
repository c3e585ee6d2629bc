//! MCP Client: connects to tool servers and routes tool calls.
//!
//! This module handles:
//! - Spawning server child processes (or attaching to open channels)
//! - The initialize / initialized / tools/list handshake per connection
//! - Concurrent calls with per-call timeouts, correlated by request id
//! - A merged catalog across servers (first-registered-wins)
//! - The `mcp-servers.json` configuration file
//! - Graceful shutdown with a grace period, then kill

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod registry;
pub mod types;

// Re-exports for convenience
pub use client::McpClient;
pub use connection::ServerConnection;
pub use errors::{FaultKind, McpError};
pub use registry::{CatalogEntry, MergedCatalog, ShadowedTool};
pub use types::{ConnectorSettings, McpServersConfig, ServerConfig, ServerStatus};

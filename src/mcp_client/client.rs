//! MCP Client: high-level interface for tool execution.
//!
//! Owns every server connection, builds the merged catalog from the ones
//! that are ready, and routes each call to the server that owns the tool.
//! Callers share one `McpClient` behind an `Arc`; calls to different
//! servers proceed independently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use super::connection::ServerConnection;
use super::errors::McpError;
use super::registry::{validate_arguments, MergedCatalog};
use super::types::{ConnectorSettings, McpServersConfig, ServerConfig, ServerStatus};
use crate::protocol::session::SessionState;
use crate::protocol::types::{ToolCallResult, ToolDefinition};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Connector that manages many servers and routes tool calls among them.
pub struct McpClient {
    /// Live and failed connections, in registration order.
    connections: RwLock<Vec<Arc<ServerConnection>>>,
    settings: ConnectorSettings,
    /// Cleared by `shutdown_all`.
    accepting: AtomicBool,
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new(ConnectorSettings::default())
    }
}

impl McpClient {
    pub fn new(settings: ConnectorSettings) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            settings,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn settings(&self) -> ConnectorSettings {
        self.settings
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn a server from its configuration, handshake, and register it.
    pub async fn add_server(&self, name: &str, config: &ServerConfig) -> Result<(), McpError> {
        self.check_can_add(name)?;
        let connection = ServerConnection::spawn(name, config, self.settings).await?;
        self.register(connection).await
    }

    /// Handshake over an existing channel and register the connection.
    pub async fn add_connection<R, W>(&self, name: &str, reader: R, writer: W) -> Result<(), McpError>
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.check_can_add(name)?;
        let connection = ServerConnection::attach(name, reader, writer, self.settings).await?;
        self.register(connection).await
    }

    /// Start every configured server.
    ///
    /// Handshakes run concurrently; successful connections are registered in
    /// name order so the merged catalog does not depend on which server
    /// answered first. Returns the servers that failed (partial startup is OK).
    pub async fn start_all(&self, config: &McpServersConfig) -> Vec<(String, McpError)> {
        let mut errors = Vec::new();
        let mut to_start = Vec::new();
        for (name, server) in &config.servers {
            match self.check_can_add(name) {
                Ok(()) => to_start.push((name.as_str(), server)),
                Err(e) => errors.push((name.clone(), e)),
            }
        }

        let settings = self.settings;
        let started = join_all(to_start.into_iter().map(|(name, server)| async move {
            (name, ServerConnection::spawn(name, server, settings).await)
        }))
        .await;

        for (name, outcome) in started {
            let result = match outcome {
                Ok(connection) => self.register(connection).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(server = %name, error = %e, "MCP server failed to start");
                errors.push((name.to_string(), e));
            }
        }

        tracing::info!(
            configured = config.servers.len(),
            ready = self.ready_connections().len(),
            failed = errors.len(),
            tools = self.tool_count(),
            "MCP servers started"
        );
        errors
    }

    /// Close every connection and start again from `config`.
    pub async fn reload(
        &self,
        config: &McpServersConfig,
    ) -> Result<Vec<(String, McpError)>, McpError> {
        self.ensure_accepting()?;
        tracing::info!(servers = config.servers.len(), "reloading MCP servers");
        self.close_all().await;
        Ok(self.start_all(config).await)
    }

    /// Close one server's connection and forget it.
    pub async fn remove_server(&self, name: &str) -> Result<(), McpError> {
        let removed = {
            let mut connections = self.write_connections();
            let position = connections.iter().position(|c| c.name() == name);
            position.map(|i| connections.remove(i))
        };

        match removed {
            Some(connection) => {
                connection.close().await;
                Ok(())
            }
            None => Err(McpError::UnknownServer {
                name: name.to_string(),
            }),
        }
    }

    /// Stop accepting calls and close every connection.
    pub async fn shutdown_all(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.close_all().await;
    }

    async fn close_all(&self) {
        let connections: Vec<_> = std::mem::take(&mut *self.write_connections());
        if connections.is_empty() {
            return;
        }
        tracing::info!(count = connections.len(), "closing MCP connections");
        join_all(connections.iter().map(|c| c.close())).await;
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Merged catalog over all ready connections.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.catalog().all_tools()
    }

    /// Catalog rebuilt from the connections that are ready right now.
    ///
    /// A tool shadowed by an earlier server becomes visible again once that
    /// server is removed or fails.
    pub fn catalog(&self) -> MergedCatalog {
        let mut catalog = MergedCatalog::new();
        for connection in self.ready_connections() {
            catalog.register_server_tools(connection.name(), connection.tools());
        }
        catalog
    }

    /// Call a tool with the default timeout.
    pub async fn invoke(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        self.invoke_with_timeout(tool_name, arguments, self.settings.call_timeout())
            .await
    }

    /// Call a tool, waiting at most `limit`.
    ///
    /// Steps:
    /// 1. Resolve the owning server through the merged catalog
    /// 2. Check arguments against the tool's schema
    /// 3. Send `tools/call` and wait for the result
    ///
    /// An unknown name comes back as an `isError` result, not an `Err`.
    pub async fn invoke_with_timeout(
        &self,
        tool_name: &str,
        arguments: Value,
        limit: Duration,
    ) -> Result<ToolCallResult, McpError> {
        self.ensure_accepting()?;

        let catalog = self.catalog();
        let Some(entry) = catalog.entry(tool_name) else {
            tracing::warn!(tool = %tool_name, "call for unknown tool");
            return Ok(unknown_tool(tool_name));
        };
        validate_arguments(&entry.tool, &arguments)?;

        let connection = self
            .connection(&entry.server)
            .ok_or_else(|| McpError::UnknownServer {
                name: entry.server.clone(),
            })?;
        self.call(&connection, tool_name, arguments, limit).await
    }

    /// Call a tool on a named server, bypassing catalog resolution.
    ///
    /// Reaches tools that another server shadows.
    pub async fn invoke_on(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        self.ensure_accepting()?;

        let connection = self
            .connection(server_name)
            .ok_or_else(|| McpError::UnknownServer {
                name: server_name.to_string(),
            })?;
        let tools = connection.tools();
        let Some(tool) = tools.iter().find(|t| t.name == tool_name) else {
            return Ok(unknown_tool(tool_name));
        };
        validate_arguments(tool, &arguments)?;

        self.call(&connection, tool_name, arguments, self.settings.call_timeout())
            .await
    }

    async fn call(
        &self,
        connection: &ServerConnection,
        tool_name: &str,
        arguments: Value,
        limit: Duration,
    ) -> Result<ToolCallResult, McpError> {
        let start = Instant::now();
        let result = connection.call_tool(tool_name, arguments, limit).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(r) => tracing::info!(
                server = %connection.name(),
                tool = %tool_name,
                is_error = r.is_error,
                elapsed_ms,
                "tool call finished"
            ),
            Err(e) => tracing::warn!(
                server = %connection.name(),
                tool = %tool_name,
                error = %e,
                elapsed_ms,
                "tool call failed"
            ),
        }
        result
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Names of all registered connections, in registration order.
    pub fn server_names(&self) -> Vec<String> {
        self.read_connections()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Check if a specific server is connected and ready.
    pub fn is_server_ready(&self, name: &str) -> bool {
        self.connection_state(name) == Some(SessionState::Ready)
    }

    pub fn connection_state(&self, name: &str) -> Option<SessionState> {
        self.connection(name).map(|c| c.state())
    }

    /// Get the number of visible tools.
    pub fn tool_count(&self) -> usize {
        self.catalog().len()
    }

    /// Per-connection snapshot.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.read_connections()
            .iter()
            .map(|c| ServerStatus::new(c.name(), c.state(), c.tool_count(), c.failure()))
            .collect()
    }

    pub fn capability_summary(&self) -> String {
        self.catalog().capability_summary()
    }

    pub fn to_openai_tools(&self) -> Vec<Value> {
        self.catalog().to_openai_tools()
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn ensure_accepting(&self) -> Result<(), McpError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(McpError::ShuttingDown)
        }
    }

    /// A name may be reused only once its previous connection is terminal.
    fn check_can_add(&self, name: &str) -> Result<(), McpError> {
        self.ensure_accepting()?;
        match self.connection(name) {
            Some(existing) if !existing.state().is_terminal() => Err(McpError::DuplicateServer {
                name: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn register(&self, connection: ServerConnection) -> Result<(), McpError> {
        let connection = Arc::new(connection);
        let outcome = self.insert(&connection);

        match outcome {
            Ok(Some(stale)) => {
                tracing::info!(server = %stale.name(), state = %stale.state(), "replacing failed connection");
                stale.close().await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }

    /// Append `connection`, evicting a terminal one of the same name.
    fn insert(
        &self,
        connection: &Arc<ServerConnection>,
    ) -> Result<Option<Arc<ServerConnection>>, McpError> {
        let mut connections = self.write_connections();
        self.ensure_accepting()?;

        let stale = match connections.iter().position(|c| c.name() == connection.name()) {
            Some(i) if !connections[i].state().is_terminal() => {
                return Err(McpError::DuplicateServer {
                    name: connection.name().to_string(),
                })
            }
            Some(i) => Some(connections.remove(i)),
            None => None,
        };
        connections.push(Arc::clone(connection));
        Ok(stale)
    }

    fn connection(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.read_connections()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    fn ready_connections(&self) -> Vec<Arc<ServerConnection>> {
        self.read_connections()
            .iter()
            .filter(|c| c.is_ready())
            .cloned()
            .collect()
    }

    fn read_connections(&self) -> RwLockReadGuard<'_, Vec<Arc<ServerConnection>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_connections(&self) -> RwLockWriteGuard<'_, Vec<Arc<ServerConnection>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unknown_tool(name: &str) -> ToolCallResult {
    ToolCallResult::error_text(format!("Unknown tool: {name}"))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

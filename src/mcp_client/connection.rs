//! One live connection to a tool server.
//!
//! A connection owns:
//! - the write half of the channel, shared with its reader task
//! - a reader task that routes responses to waiting callers by id
//! - the table of in-flight requests
//! - the session state cell
//! - for spawned servers, the child process and a stderr drain
//!
//! Responses may arrive in any order. A call that times out frees only its
//! own slot; a transport or protocol failure fails every slot at once and
//! moves the session to `Errored`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::errors::McpError;
use super::types::{ConnectorSettings, ServerConfig};
use crate::protocol::errors::TransportError as FrameError;
use crate::protocol::session::{Session, SessionState};
use crate::protocol::transport::{frames, BoxedWriter, FrameStream, FrameWriter, Inbound};
use crate::protocol::types::{
    error_codes, methods, Implementation, InitializeParams, InitializeResult, JsonRpcRequest,
    JsonRpcResponse, ListToolsResult, Message, RequestId, ToolCallResult, ToolDefinition,
    PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Characters of child stderr kept for error reports.
const STDERR_TAIL_CHARS: usize = 2000;

/// How long to wait for a failed child's stderr to drain.
const STDERR_SETTLE: Duration = Duration::from_millis(500);

type Reply = Result<Value, McpError>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Pending Requests ────────────────────────────────────────────────────────

#[derive(Default)]
struct PendingSlots {
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
    /// Set once the connection is finished; new requests fail with it.
    closed: Option<McpError>,
}

/// In-flight requests keyed by id.
#[derive(Default)]
struct PendingTable {
    slots: StdMutex<PendingSlots>,
    drained: Notify,
}

impl PendingTable {
    fn register(&self, id: u64) -> Result<oneshot::Receiver<Reply>, McpError> {
        let mut slots = lock(&self.slots);
        if let Some(err) = &slots.closed {
            return Err(err.clone());
        }
        let (tx, rx) = oneshot::channel();
        slots.waiters.insert(id, tx);
        Ok(rx)
    }

    /// Deliver a reply. `false` if nobody is waiting for `id`.
    fn resolve(&self, id: u64, reply: Reply) -> bool {
        let waiter = self.remove(id);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    fn cancel(&self, id: u64) {
        self.remove(id);
    }

    fn remove(&self, id: u64) -> Option<oneshot::Sender<Reply>> {
        let mut slots = lock(&self.slots);
        let waiter = slots.waiters.remove(&id);
        if waiter.is_some() && slots.waiters.is_empty() {
            self.drained.notify_waiters();
        }
        waiter
    }

    /// Fail every waiter with `err` and refuse new registrations.
    fn fail_all(&self, err: McpError) {
        let waiters: Vec<_> = {
            let mut slots = lock(&self.slots);
            if slots.closed.is_none() {
                slots.closed = Some(err.clone());
            }
            slots.waiters.drain().map(|(_, tx)| tx).collect()
        };
        for tx in waiters {
            let _ = tx.send(Err(err.clone()));
        }
        self.drained.notify_waiters();
    }

    fn len(&self) -> usize {
        lock(&self.slots).waiters.len()
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.len() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Frees a pending slot when the awaiting future is dropped (timeout or
/// caller cancellation).
struct SlotGuard<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.table.cancel(self.id);
    }
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Rolling tail of a child's stderr.
#[derive(Clone, Default)]
struct StderrTail(Arc<StdMutex<String>>);

impl StderrTail {
    fn push(&self, line: &str) {
        let mut buf = lock(&self.0);
        buf.push_str(line);
        buf.push('\n');
        let excess = buf.chars().count().saturating_sub(STDERR_TAIL_CHARS);
        if excess > 0 {
            let cut = buf
                .char_indices()
                .nth(excess)
                .map(|(idx, _)| idx)
                .unwrap_or(buf.len());
            buf.drain(..cut);
        }
    }

    fn snapshot(&self) -> String {
        lock(&self.0).trim().to_string()
    }
}

/// Forward the child's stderr to tracing, keeping a tail for error reports.
fn spawn_stderr_drain(server: &str, stderr: ChildStderr, tail: StderrTail) -> JoinHandle<()> {
    let server = server.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(server = %server, line = %line, "server stderr");
                    tail.push(&line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {stderr}")
    }
}

// ─── ServerConnection ────────────────────────────────────────────────────────

/// A handshaken connection to one tool server.
pub struct ServerConnection {
    name: String,
    id: Uuid,
    settings: ConnectorSettings,
    writer: Arc<FrameWriter>,
    session: Arc<StdMutex<Session>>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    tools: StdMutex<Vec<ToolDefinition>>,
    server_info: StdMutex<Option<Implementation>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    child: Mutex<Option<Child>>,
    stderr_tail: Option<StderrTail>,
    stderr_task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl ServerConnection {
    /// Launch `config` as a child process and handshake over its stdio.
    ///
    /// On handshake failure the child is killed and the tail of its stderr
    /// is appended to the error.
    pub async fn spawn(
        name: &str,
        config: &ServerConfig,
        settings: ConnectorSettings,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.envs(&config.env);

        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let tail = StderrTail::default();
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_drain(name, stderr, tail.clone()));

        tracing::info!(
            server = %name,
            command = %config.command,
            pid = child.id(),
            "spawned MCP server"
        );

        let connection = Self::start(
            name,
            stdout,
            Box::new(stdin),
            Some(child),
            Some(tail),
            stderr_task,
            settings,
        );
        connection.initialize().await?;
        Ok(connection)
    }

    /// Handshake over an already-open channel (in-process servers, tests).
    pub async fn attach<R, W>(
        name: &str,
        reader: R,
        writer: W,
        settings: ConnectorSettings,
    ) -> Result<Self, McpError>
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Self::start(name, reader, Box::new(writer), None, None, None, settings);
        connection.initialize().await?;
        Ok(connection)
    }

    fn start<R>(
        name: &str,
        reader: R,
        writer: BoxedWriter,
        child: Option<Child>,
        stderr_tail: Option<StderrTail>,
        stderr_task: Option<JoinHandle<()>>,
        settings: ConnectorSettings,
    ) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let id = Uuid::new_v4();
        let writer = Arc::new(FrameWriter::new(name, writer));
        let session = Arc::new(StdMutex::new(Session::new()));
        let pending = Arc::new(PendingTable::default());

        let reader_task = spawn_reader(
            name.to_string(),
            id,
            frames(reader),
            Arc::clone(&writer),
            Arc::clone(&session),
            Arc::clone(&pending),
        );

        Self {
            name: name.to_string(),
            id,
            settings,
            writer,
            session,
            pending,
            next_id: AtomicU64::new(1),
            tools: StdMutex::new(Vec::new()),
            server_info: StdMutex::new(None),
            reader_task: StdMutex::new(Some(reader_task)),
            child: Mutex::new(child),
            stderr_tail,
            stderr_task: StdMutex::new(stderr_task),
        }
    }

    // ─── Handshake ───────────────────────────────────────────────────────

    async fn initialize(&self) -> Result<(), McpError> {
        let limit = self.settings.init_timeout();
        let reason = match tokio::time::timeout(limit, self.handshake()).await {
            Ok(Ok(())) => {
                tracing::info!(
                    server = %self.name,
                    connection_id = %self.id,
                    tools = self.tool_count(),
                    "MCP server ready"
                );
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("initialization timed out after {}ms", limit.as_millis()),
        };

        self.abandon(&reason).await;
        let stderr = self.stderr_context().await;
        if !stderr.is_empty() {
            tracing::warn!(server = %self.name, stderr = %stderr, "server stderr captured on failure");
        }
        Err(McpError::InitFailed {
            name: self.name.clone(),
            reason: format!("{reason}{}", format_stderr_suffix(&stderr)),
        })
    }

    /// `initialize` → check for the tools capability →
    /// `notifications/initialized` → `tools/list`.
    async fn handshake(&self) -> Result<(), McpError> {
        self.with_session(Session::begin_handshake)
            .map_err(|e| McpError::protocol(&self.name, e))?;

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let params = serde_json::to_value(params).map_err(|e| McpError::InitFailed {
            name: self.name.clone(),
            reason: format!("failed to encode initialize params: {e}"),
        })?;

        let id = self.next_request_id();
        let result = self.request(id, methods::INITIALIZE, Some(params)).await?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::ProtocolViolation {
                server: self.name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        if init.capabilities.tools.is_none() {
            return Err(McpError::ProtocolViolation {
                server: self.name.clone(),
                reason: "server does not advertise the tools capability".into(),
            });
        }
        if init.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                server = %self.name,
                offered = %PROTOCOL_VERSION,
                accepted = %init.protocol_version,
                "server answered with a different protocol version"
            );
        }
        if let Some(info) = &init.server_info {
            tracing::debug!(server = %self.name, server_name = %info.name, server_version = %info.version, "server info");
        }
        *lock(&self.server_info) = init.server_info;

        self.notify(methods::INITIALIZED, None).await?;
        self.with_session(Session::complete_handshake)
            .map_err(|e| McpError::protocol(&self.name, e))?;

        self.refresh_tools().await?;
        Ok(())
    }

    // ─── Operations ──────────────────────────────────────────────────────

    /// Re-run discovery and replace the cached catalog.
    pub async fn refresh_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        self.ensure_ready(methods::TOOLS_LIST)?;
        let id = self.next_request_id();
        let result = self.request(id, methods::TOOLS_LIST, None).await?;
        let listed: ListToolsResult = match serde_json::from_value(result) {
            Ok(listed) => listed,
            Err(e) => {
                return Err(self.violation(format!("invalid tools/list result: {e}")));
            }
        };

        *lock(&self.tools) = listed.tools.clone();
        Ok(listed.tools)
    }

    /// Send `tools/call` and wait at most `limit` for the result.
    ///
    /// A JSON-RPC error response comes back as an `isError` result. A
    /// timeout fails only this call; the connection stays usable and a late
    /// response is dropped.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        limit: Duration,
    ) -> Result<ToolCallResult, McpError> {
        self.ensure_ready(methods::TOOLS_CALL)?;

        let id = self.next_request_id();
        let params = json!({ "name": tool, "arguments": arguments });
        let response =
            match tokio::time::timeout(limit, self.request(id, methods::TOOLS_CALL, Some(params)))
                .await
            {
                Ok(response) => response,
                Err(_) => {
                    tracing::warn!(
                        server = %self.name,
                        tool = %tool,
                        request_id = id,
                        timeout_ms = limit.as_millis() as u64,
                        "tool call timed out"
                    );
                    self.send_cancellation(id, "timeout");
                    return Err(McpError::Timeout {
                        tool: tool.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            };

        match response {
            Ok(value) => serde_json::from_value::<ToolCallResult>(value)
                .map_err(|e| self.violation(format!("invalid tools/call result: {e}"))),
            Err(McpError::ServerError { code, message, .. }) => {
                tracing::warn!(server = %self.name, tool = %tool, code, message = %message, "tools/call rejected");
                Ok(ToolCallResult::error_text(format!("[{code}] {message}")))
            }
            Err(e) => Err(e),
        }
    }

    /// Round-trip a `ping`.
    pub async fn ping(&self, limit: Duration) -> Result<(), McpError> {
        self.ensure_ready(methods::PING)?;
        let id = self.next_request_id();
        match tokio::time::timeout(limit, self.request(id, methods::PING, None)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(McpError::Timeout {
                tool: methods::PING.to_string(),
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Close the connection.
    ///
    /// Waits up to the shutdown grace for in-flight calls, closes the
    /// server's input, fails whatever is still pending, and then waits for
    /// the child to exit (killing it after another grace period).
    pub async fn close(&self) {
        let grace = self.settings.shutdown_grace();
        let began = self.with_session(Session::begin_close);

        if began && self.pending.len() > 0 {
            tracing::info!(
                server = %self.name,
                in_flight = self.pending.len(),
                "waiting for in-flight calls before closing"
            );
            if tokio::time::timeout(grace, self.pending.wait_drained())
                .await
                .is_err()
            {
                tracing::warn!(server = %self.name, "grace period expired with calls in flight");
            }
        }

        self.close_writer(grace).await;
        self.pending.fail_all(McpError::ConnectionClosed {
            server: self.name.clone(),
            reason: "connection closed".into(),
        });
        self.reap_child(grace).await;
        self.stop_reader();
        let _ = self.with_session(Session::finish_close);

        tracing::info!(server = %self.name, connection_id = %self.id, state = %self.state(), "connection closed");
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        lock(&self.session).state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Why the connection entered `Errored`.
    pub fn failure(&self) -> Option<String> {
        lock(&self.session).failure().map(str::to_string)
    }

    /// Cached discovery result.
    pub fn tools(&self) -> Vec<ToolDefinition> {
        lock(&self.tools).clone()
    }

    pub fn tool_count(&self) -> usize {
        lock(&self.tools).len()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        lock(&self.server_info).clone()
    }

    /// Requests sent and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut Session) -> T) -> T {
        f(&mut lock(&self.session))
    }

    fn ensure_ready(&self, operation: &str) -> Result<(), McpError> {
        lock(&self.session)
            .ensure_ready(operation)
            .map_err(|e| McpError::protocol(&self.name, e))
    }

    async fn request(&self, id: u64, method: &str, params: Option<Value>) -> Reply {
        let rx = self.pending.register(id)?;
        let _slot = SlotGuard {
            table: &self.pending,
            id,
        };

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.writer.send(&request).await {
            return Err(self.write_failed(e));
        }
        tracing::trace!(server = %self.name, method = %method, request_id = id, "request sent");

        rx.await.unwrap_or_else(|_| {
            Err(McpError::ConnectionClosed {
                server: self.name.clone(),
                reason: "request abandoned".into(),
            })
        })
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let note = JsonRpcRequest::notification(method, params);
        self.writer
            .send(&note)
            .await
            .map_err(|e| self.write_failed(e))
    }

    /// Best-effort `notifications/cancelled` for an abandoned request.
    fn send_cancellation(&self, request_id: u64, reason: &str) {
        let writer = Arc::clone(&self.writer);
        let note = JsonRpcRequest::notification(
            methods::CANCELLED,
            Some(json!({ "requestId": request_id, "reason": reason })),
        );
        let server = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = writer.send(&note).await {
                tracing::debug!(server = %server, error = %e, "could not send cancellation");
            }
        });
    }

    fn write_failed(&self, e: FrameError) -> McpError {
        let closed_locally = matches!(e, FrameError::Closed);
        let err = McpError::transport(&self.name, e);
        if !closed_locally {
            terminate(&self.name, &self.session, &self.pending, err.clone());
        }
        err
    }

    fn violation(&self, reason: String) -> McpError {
        let err = McpError::ProtocolViolation {
            server: self.name.clone(),
            reason,
        };
        terminate(&self.name, &self.session, &self.pending, err.clone());
        err
    }

    /// Tear down after a failed handshake.
    async fn abandon(&self, reason: &str) {
        terminate(
            &self.name,
            &self.session,
            &self.pending,
            McpError::ConnectionClosed {
                server: self.name.clone(),
                reason: reason.to_string(),
            },
        );
        self.close_writer(self.settings.shutdown_grace()).await;
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.kill().await;
        }
        self.stop_reader();
    }

    /// Close the server's input. A server that stopped reading gets its
    /// channel dropped once `grace` runs out.
    async fn close_writer(&self, grace: Duration) {
        if tokio::time::timeout(grace, self.writer.close()).await.is_err() {
            tracing::warn!(server = %self.name, "server input not drained, dropping it");
            self.writer.abort();
        }
    }

    async fn reap_child(&self, grace: Duration) {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return;
        };

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, status = %status, "server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.name, error = %e, "failed to wait for server exit");
            }
            Err(_) => {
                tracing::warn!(server = %self.name, "server did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
        *guard = None;
    }

    /// Stderr tail after the child has gone away.
    async fn stderr_context(&self) -> String {
        let Some(tail) = &self.stderr_tail else {
            return String::new();
        };
        let task = lock(&self.stderr_task).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(STDERR_SETTLE, &mut task).await.is_err() {
                task.abort();
            }
        }
        tail.snapshot()
    }

    fn stop_reader(&self) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.stop_reader();
        if let Some(task) = lock(&self.stderr_task).take() {
            task.abort();
        }
    }
}

// ─── Reader Task ─────────────────────────────────────────────────────────────

/// Fail the connection: `Errored` (unless it is already closing) and every
/// pending call resolved with `err`.
fn terminate(server: &str, session: &StdMutex<Session>, pending: &PendingTable, err: McpError) {
    {
        let mut session = lock(session);
        if session.state() == SessionState::Closing {
            tracing::debug!(server = %server, reason = %err, "channel ended during close");
        } else if session.fail(err.to_string()) {
            tracing::warn!(server = %server, error = %err, "connection failed");
        }
    }
    pending.fail_all(err);
}

fn spawn_reader(
    server: String,
    connection_id: Uuid,
    mut inbound: FrameStream,
    writer: Arc<FrameWriter>,
    session: Arc<StdMutex<Session>>,
    pending: Arc<PendingTable>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let err = loop {
            let value = match inbound.next().await {
                None => {
                    break McpError::ConnectionClosed {
                        server: server.clone(),
                        reason: "server closed its output".into(),
                    }
                }
                Some(Err(e)) => break McpError::transport(&server, e),
                Some(Ok(Inbound::Malformed { line, reason })) => {
                    break McpError::ProtocolViolation {
                        server: server.clone(),
                        reason: format!("unparsable frame ({reason}): {line}"),
                    }
                }
                Some(Ok(Inbound::Oversized { max_bytes })) => {
                    break McpError::ProtocolViolation {
                        server: server.clone(),
                        reason: format!("frame exceeds {max_bytes} bytes"),
                    }
                }
                Some(Ok(Inbound::Message(value))) => value,
            };

            match Message::from_value(value) {
                Ok(Message::Response(response)) => route_response(&server, &pending, response),
                Ok(Message::Request(request)) => answer_server_request(&server, &writer, request).await,
                Ok(Message::Notification(note)) => {
                    tracing::debug!(server = %server, method = %note.method, "server notification");
                }
                Err(e) => {
                    break McpError::ProtocolViolation {
                        server: server.clone(),
                        reason: e.to_string(),
                    }
                }
            }
        };

        tracing::debug!(server = %server, connection_id = %connection_id, reason = %err, "reader stopped");
        terminate(&server, &session, &pending, err);
    })
}

fn route_response(server: &str, pending: &PendingTable, response: JsonRpcResponse) {
    let id = match &response.id {
        Some(RequestId::Number(n)) => *n,
        Some(RequestId::String(s)) => match s.parse::<u64>() {
            Ok(n) => n,
            Err(_) => {
                tracing::warn!(server = %server, id = %s, "response with foreign id");
                return;
            }
        },
        None => {
            tracing::warn!(server = %server, error = ?response.error, "error response without id");
            return;
        }
    };

    if !pending.resolve(id, extract_result(response)) {
        tracing::debug!(server = %server, request_id = id, "discarding late or unknown response");
    }
}

/// Servers may ping us; everything else is unsupported.
async fn answer_server_request(
    server: &str,
    writer: &FrameWriter,
    request: JsonRpcRequest,
) {
    let Some(id) = request.id else {
        return;
    };
    let response = if request.method == methods::PING {
        JsonRpcResponse::success(id, json!({}))
    } else {
        tracing::debug!(server = %server, method = %request.method, "unsupported server request");
        JsonRpcResponse::failure(
            Some(id),
            error_codes::METHOD_NOT_FOUND,
            format!("method not found: {}", request.method),
        )
    };
    if let Err(e) = writer.send(&response).await {
        tracing::debug!(server = %server, error = %e, "could not answer server request");
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_server::time_tools::time_server;
    use crate::protocol::types::JsonRpcError;
    use tokio::io::{AsyncWriteExt, DuplexStream, Lines};

    fn settings() -> ConnectorSettings {
        ConnectorSettings {
            call_timeout_ms: 1_000,
            init_timeout_ms: 2_000,
            shutdown_grace_ms: 200,
        }
    }

    async fn time_connection(name: &str) -> ServerConnection {
        let host = time_server().unwrap();
        let (client_out, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_in) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move { host.serve(server_in, server_out).await });
        ServerConnection::attach(name, client_in, client_out, settings())
            .await
            .unwrap()
    }

    /// Hand-driven server end for scripting misbehaviour.
    struct FakeServer {
        lines: Lines<BufReader<DuplexStream>>,
        out: DuplexStream,
    }

    impl FakeServer {
        async fn recv(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.out.write_all(line.as_bytes()).await.unwrap();
        }

        async fn handshake(&mut self, tools: Value) {
            let init = self.recv().await;
            assert_eq!(init["method"], "initialize");
            self.send(json!({
                "jsonrpc": "2.0", "id": init["id"],
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake", "version": "1"}
                }
            }))
            .await;
            assert_eq!(self.recv().await["method"], "notifications/initialized");
            let list = self.recv().await;
            assert_eq!(list["method"], "tools/list");
            self.send(json!({"jsonrpc": "2.0", "id": list["id"], "result": {"tools": tools}}))
                .await;
        }
    }

    async fn fake_pair() -> (
        tokio::task::JoinHandle<Result<ServerConnection, McpError>>,
        FakeServer,
    ) {
        let (client_out, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out, client_in) = tokio::io::duplex(64 * 1024);
        let attach = tokio::spawn(async move {
            ServerConnection::attach("fake", client_in, client_out, settings()).await
        });
        let fake = FakeServer {
            lines: BufReader::new(server_in).lines(),
            out: server_out,
        };
        (attach, fake)
    }

    #[tokio::test]
    async fn test_attach_discovers_tools() {
        let conn = time_connection("time").await;
        assert!(conn.is_ready());
        assert_eq!(conn.tool_count(), 3);
        assert_eq!(conn.server_info().unwrap().name, "time-server");
        conn.ping(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_call_tool_over_duplex() {
        let conn = time_connection("time").await;
        let result = conn
            .call_tool("get_current_time", json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(result.text().starts_with("Current time: "));
        assert_eq!(conn.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_responses_out_of_order() {
        let (attach, mut fake) = fake_pair().await;
        fake.handshake(json!([{"name": "slow"}, {"name": "fast"}])).await;
        let conn = Arc::new(attach.await.unwrap().unwrap());

        let c1 = Arc::clone(&conn);
        let slow = tokio::spawn(async move {
            c1.call_tool("slow", json!({}), Duration::from_secs(2)).await
        });
        let first = fake.recv().await;
        let c2 = Arc::clone(&conn);
        let fast = tokio::spawn(async move {
            c2.call_tool("fast", json!({}), Duration::from_secs(2)).await
        });
        let second = fake.recv().await;

        fake.send(json!({"jsonrpc": "2.0", "id": second["id"],
            "result": {"content": [{"type": "text", "text": second["params"]["name"]}]}}))
            .await;
        fake.send(json!({"jsonrpc": "2.0", "id": first["id"],
            "result": {"content": [{"type": "text", "text": first["params"]["name"]}]}}))
            .await;

        assert_eq!(slow.await.unwrap().unwrap().text(), "slow");
        assert_eq!(fast.await.unwrap().unwrap().text(), "fast");
    }

    #[tokio::test]
    async fn test_timeout_keeps_connection_ready() {
        let (attach, mut fake) = fake_pair().await;
        fake.handshake(json!([{"name": "hang"}])).await;
        let conn = attach.await.unwrap().unwrap();

        let err = conn
            .call_tool("hang", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert!(conn.is_ready());
        assert_eq!(conn.in_flight(), 0);

        let call = fake.recv().await;
        let cancel = fake.recv().await;
        assert_eq!(cancel["method"], "notifications/cancelled");
        assert_eq!(cancel["params"]["requestId"], call["id"]);

        // The late answer is dropped and the next call still works.
        fake.send(json!({"jsonrpc": "2.0", "id": call["id"], "result": {"content": []}}))
            .await;
        let next = tokio::spawn(async move {
            let result = conn.call_tool("hang", json!({}), Duration::from_secs(1)).await;
            (conn, result)
        });
        let call = fake.recv().await;
        fake.send(json!({"jsonrpc": "2.0", "id": call["id"],
            "result": {"content": [{"type": "text", "text": "done"}]}}))
            .await;
        let (conn, result) = next.await.unwrap();
        assert_eq!(result.unwrap().text(), "done");
        assert!(conn.is_ready());
    }

    #[tokio::test]
    async fn test_timeout_while_server_not_reading_keeps_frames_whole() {
        let (attach, mut fake) = fake_pair().await;
        fake.handshake(json!([{"name": "upload"}])).await;
        let conn = attach.await.unwrap().unwrap();

        // Larger than the pipe, so the write is still in progress at the deadline.
        let blob = "z".repeat(256 * 1024);
        let err = conn
            .call_tool("upload", json!({"blob": blob}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert!(conn.is_ready());

        let call = fake.recv().await;
        assert_eq!(call["method"], "tools/call");
        assert_eq!(call["params"]["arguments"]["blob"].as_str().map(str::len), Some(256 * 1024));
        let cancel = fake.recv().await;
        assert_eq!(cancel["method"], "notifications/cancelled");
        assert_eq!(cancel["params"]["requestId"], call["id"]);

        let next = tokio::spawn(async move {
            let result = conn.call_tool("upload", json!({}), Duration::from_secs(1)).await;
            (conn, result)
        });
        let call = fake.recv().await;
        fake.send(json!({"jsonrpc": "2.0", "id": call["id"],
            "result": {"content": [{"type": "text", "text": "stored"}]}}))
            .await;
        let (_conn, result) = next.await.unwrap();
        assert_eq!(result.unwrap().text(), "stored");
    }

    #[tokio::test]
    async fn test_error_response_becomes_error_result() {
        let (attach, mut fake) = fake_pair().await;
        fake.handshake(json!([{"name": "t"}])).await;
        let conn = attach.await.unwrap().unwrap();

        let call = tokio::spawn(async move {
            conn.call_tool("t", json!({}), Duration::from_secs(1)).await
        });
        let req = fake.recv().await;
        fake.send(json!({"jsonrpc": "2.0", "id": req["id"],
            "error": {"code": -32602, "message": "bad params"}}))
            .await;
        let result = call.await.unwrap().unwrap();
        assert!(result.is_error);
        assert_eq!(result.text(), "[-32602] bad params");
    }

    #[tokio::test]
    async fn test_malformed_frame_errors_connection() {
        let (attach, mut fake) = fake_pair().await;
        fake.handshake(json!([{"name": "t"}])).await;
        let conn = Arc::new(attach.await.unwrap().unwrap());

        let c = Arc::clone(&conn);
        let call = tokio::spawn(async move {
            c.call_tool("t", json!({}), Duration::from_secs(5)).await
        });
        fake.recv().await;
        fake.out.write_all(b"Server started!\n").await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::ProtocolViolation { .. }));
        assert_eq!(conn.state(), SessionState::Errored);
        assert!(conn.failure().unwrap().contains("Server started!"));

        let err = conn
            .call_tool("t", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_server_eof_fails_pending_call() {
        let (attach, mut fake) = fake_pair().await;
        fake.handshake(json!([{"name": "t"}])).await;
        let conn = Arc::new(attach.await.unwrap().unwrap());

        let c = Arc::clone(&conn);
        let call = tokio::spawn(async move {
            c.call_tool("t", json!({}), Duration::from_secs(5)).await
        });
        fake.recv().await;
        drop(fake);

        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_connection_fatal());
        assert_eq!(conn.state(), SessionState::Errored);
    }

    #[tokio::test]
    async fn test_close_fails_pending_call_after_grace() {
        let (attach, mut fake) = fake_pair().await;
        fake.handshake(json!([{"name": "t"}])).await;
        let conn = Arc::new(attach.await.unwrap().unwrap());

        let c = Arc::clone(&conn);
        let call = tokio::spawn(async move {
            c.call_tool("t", json!({}), Duration::from_secs(30)).await
        });
        fake.recv().await;

        conn.close().await;
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed { .. }));
        assert_eq!(conn.state(), SessionState::Closed);

        // The server sees end-of-input once the writer is shut down.
        assert!(fake.lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_tools_capability_fails_init() {
        let (attach, mut fake) = fake_pair().await;
        let init = fake.recv().await;
        fake.send(json!({"jsonrpc": "2.0", "id": init["id"],
            "result": {"protocolVersion": PROTOCOL_VERSION, "capabilities": {}}}))
            .await;

        let err = attach.await.unwrap().unwrap_err();
        match err {
            McpError::InitFailed { name, reason } => {
                assert_eq!(name, "fake");
                assert!(reason.contains("tools capability"));
            }
            other => panic!("expected InitFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_init_timeout() {
        let (client_out, _server_in) = tokio::io::duplex(1024);
        let (_server_out, client_in) = tokio::io::duplex(1024);
        let quick = ConnectorSettings {
            init_timeout_ms: 50,
            ..settings()
        };
        let err = ServerConnection::attach("mute", client_in, client_out, quick)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (attach, mut fake) = fake_pair().await;
        fake.handshake(json!([])).await;
        let _conn = attach.await.unwrap().unwrap();

        fake.send(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"})).await;
        let pong = fake.recv().await;
        assert_eq!(pong["id"], "srv-1");
        assert!(pong["result"].is_object());

        fake.send(json!({"jsonrpc": "2.0", "id": 9, "method": "sampling/createMessage"}))
            .await;
        assert_eq!(fake.recv().await["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_stderr_tail_keeps_last_chars() {
        let tail = StderrTail::default();
        for i in 0..500 {
            tail.push(&format!("line {i}"));
        }
        let snap = tail.snapshot();
        assert!(snap.chars().count() <= STDERR_TAIL_CHARS);
        assert!(snap.ends_with("line 499"));
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(RequestId::Number(1)),
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(RequestId::Number(1)),
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp),
            Err(McpError::ServerError { .. })
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_command() {
        let config = ServerConfig {
            command: "/nonexistent/toolbridge-test-server".into(),
            ..Default::default()
        };
        let err = ServerConnection::spawn("ghost", &config, settings())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
    }
}

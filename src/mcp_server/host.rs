//! Tool server host: the serve loop for one tool-providing process.
//!
//! Reads framed requests, drives the session through the handshake, routes
//! `tools/list` and `tools/call` to the dispatcher, and writes one response
//! per request. Stops on end-of-input or when the shutdown future resolves
//! (SIGINT/SIGTERM for [`ServerHost::serve_stdio`]), closing the session
//! before returning.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use super::dispatcher::Dispatcher;
use crate::protocol::errors::TransportError;
use crate::protocol::session::Session;
use crate::protocol::transport::{frames_with_limit, FrameStream, FrameWriter, Inbound, MAX_FRAME_BYTES};
use crate::protocol::types::{
    error_codes, methods, CallToolParams, Implementation, InitializeParams, InitializeResult,
    JsonRpcRequest, JsonRpcResponse, Message, RequestId, ServerCapabilities, ToolCallRequest,
    ToolsCapability, PROTOCOL_VERSION,
};

/// How long the final flush may take before pending output is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Why the serve loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The client closed our input.
    InputClosed,
    /// The shutdown future resolved (a termination signal for stdio hosts).
    Signal,
}

/// One tool server: identity plus dispatcher.
#[derive(Debug)]
pub struct ServerHost {
    info: Implementation,
    dispatcher: Dispatcher,
    instructions: Option<String>,
    max_frame_bytes: usize,
}

enum Step {
    Continue,
    InputClosed,
}

impl ServerHost {
    pub fn new(info: Implementation, dispatcher: Dispatcher) -> Self {
        Self {
            info,
            dispatcher,
            instructions: None,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    /// Free-form usage hints returned in the `initialize` result.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Longest inbound line answered as a message; longer ones get a
    /// parse error.
    pub fn with_max_frame_bytes(mut self, max_bytes: usize) -> Self {
        self.max_frame_bytes = max_bytes;
        self
    }

    pub fn info(&self) -> &Implementation {
        &self.info
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Serve on this process's stdin/stdout until end-of-input or a
    /// termination signal.
    pub async fn serve_stdio(&self) -> Result<ShutdownReason, TransportError> {
        // Handlers are installed before the banner, so a signal sent after
        // it is always seen.
        let shutdown = shutdown_signal();
        tracing::info!(
            server = %self.info.name,
            version = %self.info.version,
            tools = self.dispatcher.registry().len(),
            "tool server started on stdio"
        );
        self.serve_until(tokio::io::stdin(), tokio::io::stdout(), shutdown)
            .await
    }

    /// Serve until the peer closes its side.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<ShutdownReason, TransportError>
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.serve_until(reader, writer, std::future::pending::<()>())
            .await
    }

    /// Serve until the peer closes its side or `shutdown` resolves.
    ///
    /// A transport failure ends the loop with `Err`; everything a client or
    /// handler does wrong is answered in-band and serving continues.
    pub async fn serve_until<R, W, S>(
        &self,
        reader: R,
        writer: W,
        shutdown: S,
    ) -> Result<ShutdownReason, TransportError>
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Future<Output = ()>,
    {
        let writer = FrameWriter::new("client", writer);
        let mut inbound = frames_with_limit(reader, self.max_frame_bytes);
        let mut session = Session::new();
        tokio::pin!(shutdown);

        let reason = loop {
            let outcome = tokio::select! {
                biased;
                _ = &mut shutdown => None,
                step = self.step(&mut session, &writer, &mut inbound) => Some(step),
            };

            match outcome {
                None => break ShutdownReason::Signal,
                Some(Ok(Step::Continue)) => {}
                Some(Ok(Step::InputClosed)) => break ShutdownReason::InputClosed,
                Some(Err(e)) => {
                    session.fail(e.to_string());
                    tracing::error!(server = %self.info.name, error = %e, "transport failed, stopping");
                    return Err(e);
                }
            }
        };

        session.begin_close();
        if tokio::time::timeout(CLOSE_TIMEOUT, writer.close()).await.is_err() {
            tracing::warn!(server = %self.info.name, "client stopped reading, dropping unsent output");
            writer.abort();
        }
        let _ = session.finish_close();
        tracing::info!(server = %self.info.name, reason = ?reason, "session closed");
        Ok(reason)
    }

    /// Read one frame and answer it.
    async fn step(
        &self,
        session: &mut Session,
        writer: &FrameWriter,
        inbound: &mut FrameStream,
    ) -> Result<Step, TransportError> {
        let Some(item) = inbound.next().await else {
            return Ok(Step::InputClosed);
        };

        let response = match item? {
            Inbound::Malformed { line, reason } => {
                tracing::warn!(line = %line, reason = %reason, "unparsable frame");
                Some(JsonRpcResponse::failure(
                    None,
                    error_codes::PARSE_ERROR,
                    format!("parse error: {reason}"),
                ))
            }
            Inbound::Oversized { max_bytes } => {
                tracing::warn!(max_bytes, "frame too long, discarded");
                Some(JsonRpcResponse::failure(
                    None,
                    error_codes::PARSE_ERROR,
                    format!("parse error: frame exceeds {max_bytes} bytes"),
                ))
            }
            Inbound::Message(value) => self.handle_value(session, value).await,
        };

        if let Some(response) = response {
            writer.send(&response).await?;
        }
        Ok(Step::Continue)
    }

    async fn handle_value(&self, session: &mut Session, value: Value) -> Option<JsonRpcResponse> {
        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "invalid JSON-RPC message");
                return Some(JsonRpcResponse::failure(
                    None,
                    error_codes::INVALID_REQUEST,
                    e.to_string(),
                ));
            }
        };

        match message {
            Message::Request(request) => match request.id.clone() {
                Some(id) => Some(self.handle_request(session, id, request).await),
                None => {
                    self.handle_notification(session, &request);
                    None
                }
            },
            Message::Notification(note) => {
                self.handle_notification(session, &note);
                None
            }
            Message::Response(response) => {
                tracing::debug!(id = ?response.id, "ignoring unsolicited response");
                None
            }
        }
    }

    async fn handle_request(
        &self,
        session: &mut Session,
        id: RequestId,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        tracing::debug!(method = %request.method, request_id = %id, "request");

        match request.method.as_str() {
            methods::INITIALIZE => self.handle_initialize(session, id, request.params),
            methods::PING => JsonRpcResponse::success(id, serde_json::json!({})),
            methods::TOOLS_LIST => {
                if let Err(e) = session.ensure_ready(methods::TOOLS_LIST) {
                    return JsonRpcResponse::failure(
                        Some(id),
                        error_codes::SERVER_NOT_INITIALIZED,
                        e.to_string(),
                    );
                }
                respond(id, &self.dispatcher.list_tools())
            }
            methods::TOOLS_CALL => {
                if let Err(e) = session.ensure_ready(methods::TOOLS_CALL) {
                    return JsonRpcResponse::failure(
                        Some(id),
                        error_codes::SERVER_NOT_INITIALIZED,
                        e.to_string(),
                    );
                }
                let params: CallToolParams =
                    match serde_json::from_value(request.params.unwrap_or(Value::Null)) {
                        Ok(params) => params,
                        Err(e) => {
                            return JsonRpcResponse::failure(
                                Some(id),
                                error_codes::INVALID_PARAMS,
                                format!("invalid tools/call params: {e}"),
                            )
                        }
                    };
                let call = ToolCallRequest {
                    id: id.clone(),
                    tool_name: params.name,
                    arguments: params.arguments,
                };
                let result = self.dispatcher.dispatch(&call).await;
                respond(id, &result)
            }
            other => JsonRpcResponse::failure(
                Some(id),
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            ),
        }
    }

    fn handle_initialize(
        &self,
        session: &mut Session,
        id: RequestId,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        let params: InitializeParams = match serde_json::from_value(params.unwrap_or(Value::Null)) {
            Ok(params) => params,
            Err(e) => {
                return JsonRpcResponse::failure(
                    Some(id),
                    error_codes::INVALID_PARAMS,
                    format!("invalid initialize params: {e}"),
                )
            }
        };

        if let Err(e) = session.begin_handshake() {
            return JsonRpcResponse::failure(Some(id), error_codes::INVALID_REQUEST, e.to_string());
        }

        tracing::info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol_version = %params.protocol_version,
            "initialize"
        );

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability::default()),
            },
            server_info: Some(self.info.clone()),
            instructions: self.instructions.clone(),
        };
        respond(id, &result)
    }

    fn handle_notification(&self, session: &mut Session, note: &JsonRpcRequest) {
        match note.method.as_str() {
            methods::INITIALIZED => {
                if let Err(e) = session.complete_handshake() {
                    tracing::warn!(error = %e, "unexpected initialized notification");
                }
            }
            methods::CANCELLED => {
                // Calls run to completion in arrival order; by the time this
                // is read the referenced call has already been answered.
                tracing::debug!(params = ?note.params, "cancellation notice");
            }
            other => tracing::debug!(method = %other, "ignoring notification"),
        }
    }
}

fn respond<T: Serialize>(id: RequestId, payload: &T) -> JsonRpcResponse {
    match serde_json::to_value(payload) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::failure(
            Some(id),
            error_codes::INTERNAL_ERROR,
            format!("failed to serialize result: {e}"),
        ),
    }
}

/// Resolves on SIGINT or SIGTERM (Ctrl-C elsewhere).
///
/// Unix handlers are registered when this is called, not on first poll.
#[cfg(unix)]
fn shutdown_signal() -> impl Future<Output = ()> {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    fn install(kind: SignalKind, name: &'static str) -> Option<Signal> {
        match signal(kind) {
            Ok(signal) => Some(signal),
            Err(e) => {
                tracing::warn!(signal = name, error = %e, "cannot install signal handler");
                None
            }
        }
    }

    async fn received(signal: Option<Signal>) {
        match signal {
            Some(mut signal) => {
                signal.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    let interrupt = install(SignalKind::interrupt(), "SIGINT");
    let terminate = install(SignalKind::terminate(), "SIGTERM");
    async move {
        tokio::select! {
            _ = received(interrupt) => tracing::info!(signal = "SIGINT", "shutting down"),
            _ = received(terminate) => tracing::info!(signal = "SIGTERM", "shutting down"),
        }
    }
}

#[cfg(not(unix))]
fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!(signal = "ctrl-c", "shutting down"),
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    }
}

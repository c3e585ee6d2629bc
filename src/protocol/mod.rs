//! MCP wire protocol shared by both ends of a connection.
//!
//! - `types`: JSON-RPC 2.0 envelopes and MCP payloads
//! - `transport`: newline-delimited framing over any async byte stream
//! - `session`: the per-connection handshake state machine
//! - `errors`: transport and protocol error types

pub mod errors;
pub mod session;
pub mod transport;
pub mod types;

pub use errors::{ProtocolError, TransportError};
pub use session::{Session, SessionState};
pub use transport::{frames, BoxedWriter, FrameStream, FrameWriter, Inbound};
pub use types::{
    ContentBlock, Implementation, JsonRpcRequest, JsonRpcResponse, Message, RequestId,
    ToolCallRequest, ToolCallResult, ToolDefinition,
};

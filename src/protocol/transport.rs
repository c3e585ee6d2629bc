//! Newline-delimited JSON framing over a byte stream.
//!
//! One JSON object per line in each direction. Outbound frames go through a
//! per-channel writer task, so bytes of two messages never interleave and a
//! sender that gives up waiting never leaves half a frame on the wire.
//! Inbound frames are exposed as a lazy stream that ends when the peer
//! closes its side.
//!
//! Only protocol frames travel here. Diagnostics go through `tracing`, whose
//! sinks (see [`crate::logging`]) never include stdout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};

use super::errors::TransportError;

/// Largest inbound line accepted. Longer lines are skipped and reported as
/// [`Inbound::Oversized`].
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frames that may wait for the writer task before `send` applies
/// backpressure.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Type-erased write half, so connections over pipes and in-memory
/// duplexes share one concrete type.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Stream of inbound frames produced by [`frames`].
pub type FrameStream = BoxStream<'static, Result<Inbound, TransportError>>;

/// One inbound line after JSON decoding.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A well-formed JSON value.
    Message(Value),
    /// A non-empty line that is not valid JSON.
    Malformed { line: String, reason: String },
    /// A line longer than the frame limit. Its bytes were discarded.
    Oversized { max_bytes: usize },
}

// ─── Writer ──────────────────────────────────────────────────────────────────

enum WriteOp {
    Frame {
        line: String,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Flushing writer of one message per line.
///
/// The channel is owned by a background task. Once a frame is queued it is
/// written in full even if the `send` future is dropped, so a caller-side
/// timeout cannot corrupt the stream for later messages.
pub struct FrameWriter {
    peer: String,
    queue: mpsc::Sender<WriteOp>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl FrameWriter {
    /// Wrap the write half of a channel. `peer` labels log lines.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<W>(peer: &str, writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, ops) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let closed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(write_loop(
            peer.to_string(),
            writer,
            ops,
            Arc::clone(&closed),
        ));
        Self {
            peer: peer.to_string(),
            queue,
            closed,
            task,
        }
    }

    /// Serialize `message`, append `\n`, and wait until it is written and
    /// flushed.
    ///
    /// Any I/O failure marks the writer closed; later sends fail fast with
    /// [`TransportError::Closed`].
    pub async fn send<T>(&self, message: &T) -> Result<(), TransportError>
    where
        T: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        // serde_json's compact output never contains a raw newline.
        let mut line = serde_json::to_string(message).map_err(|e| TransportError::Serialize {
            reason: e.to_string(),
        })?;
        line.push('\n');

        let (done, written) = oneshot::channel();
        self.queue
            .send(WriteOp::Frame { line, done })
            .await
            .map_err(|_| TransportError::Closed)?;
        written.await.unwrap_or(Err(TransportError::Closed))
    }

    /// Write everything already queued, then shut down the write half. The
    /// peer sees end-of-input.
    ///
    /// Waits for the writer task; a peer that stopped reading can stall
    /// this, see [`FrameWriter::abort`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let (done, finished) = oneshot::channel();
        if self.queue.send(WriteOp::Shutdown { done }).await.is_ok() {
            let _ = finished.await;
        }
    }

    /// Drop the channel immediately, discarding queued frames.
    pub fn abort(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if !self.task.is_finished() {
            tracing::debug!(peer = %self.peer, "aborting frame writer");
            self.task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn write_loop<W>(
    peer: String,
    mut writer: W,
    mut ops: mpsc::Receiver<WriteOp>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Frame { line, done } => {
                if let Err(e) = write_line(&mut writer, line.as_bytes()).await {
                    closed.store(true, Ordering::SeqCst);
                    tracing::debug!(peer = %peer, error = %e, "frame write failed, transport closed");
                    let _ = done.send(Err(e.into()));
                    break;
                }
                let _ = done.send(Ok(()));
            }
            WriteOp::Shutdown { done } => {
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!(peer = %peer, error = %e, "error shutting down writer");
                }
                let _ = done.send(());
                break;
            }
        }
    }
}

async fn write_line<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

// ─── Reader ──────────────────────────────────────────────────────────────────

enum RawLine {
    Line(String),
    TooLong,
}

/// `LinesCodec` that reports an over-long line as an item instead of an
/// error, so the stream keeps going after the line is discarded.
struct LineFrames {
    lines: LinesCodec,
}

impl LineFrames {
    fn lift(
        decoded: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<RawLine>, std::io::Error> {
        match decoded {
            Ok(line) => Ok(line.map(RawLine::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(RawLine::TooLong)),
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for LineFrames {
    type Item = RawLine;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawLine>, std::io::Error> {
        Self::lift(self.lines.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<RawLine>, std::io::Error> {
        Self::lift(self.lines.decode_eof(src))
    }
}

/// Turn the read half of a channel into a stream of inbound frames.
///
/// Blank lines are skipped and `\r\n` endings are accepted. The stream
/// terminates when the channel reaches end-of-input.
pub fn frames<R>(reader: R) -> FrameStream
where
    R: AsyncRead + Send + 'static,
{
    frames_with_limit(reader, MAX_FRAME_BYTES)
}

/// [`frames`] with a custom line length limit.
pub fn frames_with_limit<R>(reader: R, max_bytes: usize) -> FrameStream
where
    R: AsyncRead + Send + 'static,
{
    let codec = LineFrames {
        lines: LinesCodec::new_with_max_length(max_bytes),
    };
    FramedRead::new(reader, codec)
        .filter_map(move |item| async move {
            match item {
                Ok(RawLine::Line(line)) => decode_line(&line).map(Ok),
                Ok(RawLine::TooLong) => Some(Ok(Inbound::Oversized { max_bytes })),
                Err(e) => Some(Err(e.into())),
            }
        })
        .boxed()
}

/// Decode one line. `None` for blank lines.
pub fn decode_line(line: &str) -> Option<Inbound> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Inbound::Message(value),
        Err(e) => Inbound::Malformed {
            line: excerpt(trimmed),
            reason: e.to_string(),
        },
    })
}

/// First 200 characters of a line, for error messages.
fn excerpt(line: &str) -> String {
    const LIMIT: usize = 200;
    match line.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

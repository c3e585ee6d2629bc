//! Diagnostic logging setup.
//!
//! Diagnostics never go to stdout: a tool server's stdout carries protocol
//! frames, so [`LogSink`] has no stdout variant.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Log file name inside a [`LogSink::File`] directory.
pub const LOG_FILE_NAME: &str = "toolbridge.log";

/// Rotated log files kept next to the current one.
const KEEP_ROTATED: u32 = 3;

const DEFAULT_FILTER: &str = "toolbridge=info,warn";

/// Where diagnostics are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stderr,
    /// `<dir>/toolbridge.log`, rotated on every start.
    File { dir: PathBuf },
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {reason}")]
    CreateDir { path: String, reason: String },

    #[error("failed to open log file {path}: {reason}")]
    OpenFile { path: String, reason: String },

    #[error("tracing subscriber already installed: {reason}")]
    AlreadyInitialized { reason: String },
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the default filter. For a file sink the previous
/// logs are rotated first (`toolbridge.log` → `.1` → `.2` → `.3`) and the
/// path of the fresh log file is returned.
pub fn init_tracing(sink: LogSink) -> Result<Option<PathBuf>, LoggingError> {
    use tracing_subscriber::fmt;

    let (writer, log_path) = match &sink {
        LogSink::Stderr => (BoxMakeWriter::new(std::io::stderr), None),
        LogSink::File { dir } => {
            let path = open_log_file(dir)?;
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| LoggingError::OpenFile {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            (BoxMakeWriter::new(FlushingWriter::new(file)), Some(path))
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized {
            reason: e.to_string(),
        })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== toolbridge starting ==="
    );
    Ok(log_path)
}

/// Create `dir`, rotate old logs, and return the path of the new log file.
fn open_log_file(dir: &Path) -> Result<PathBuf, LoggingError> {
    std::fs::create_dir_all(dir).map_err(|e| LoggingError::CreateDir {
        path: dir.display().to_string(),
        reason: e.to_string(),
    })?;
    let path = dir.join(LOG_FILE_NAME);
    rotate_log_file(&path, KEEP_ROTATED);
    Ok(path)
}

/// Rotate log files: `toolbridge.log` → `toolbridge.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A file writer that flushes after every write, so a crash loses nothing.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

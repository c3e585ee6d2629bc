//! Reference tool server: current time, formatted time, and Unix timestamps
//! over MCP on stdin/stdout.
//!
//! Takes no flags. Diagnostics go to stderr (filter with `RUST_LOG`). Exits 0
//! when the client closes stdin or on SIGINT/SIGTERM, and 1 if it cannot
//! start.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use toolbridge::logging::{init_tracing, LogSink};
use toolbridge::mcp_server::time_tools::time_server;

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("time-server: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(run());
    // Stdin is read on a blocking thread that may still be parked in read().
    runtime.shutdown_timeout(Duration::from_millis(100));

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("time-server: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    init_tracing(LogSink::Stderr).context("failed to initialize logging")?;

    let host = time_server().context("failed to register time tools")?;
    let reason = host
        .serve_stdio()
        .await
        .context("transport failure on stdio")?;

    tracing::info!(reason = ?reason, "time-server stopped");
    Ok(())
}

//! Logging initialization for stdio and HTTP transport modes.
//!
//! In stdio mode stdout carries the JSON-RPC stream, and MCP clients
//! treat stderr output during the handshake as a broken connection, so
//! logging is disabled entirely unless a log file is configured.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Which transport the server was started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Stream,
}

/// Initializes tracing according to the transport mode.
///
/// - `log_file` given: append to that file (both modes).
/// - Stream mode without a file: log to stderr.
/// - Stdio mode without a file: logging stays off.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(
    mode: TransportMode,
    log_file: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = log_file {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
        return Ok(());
    }

    if mode == TransportMode::Stream {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

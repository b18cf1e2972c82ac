//! Transport module - platform-specific local IPC endpoints.
//!
//! The runtime core consumes any `AsyncRead + AsyncWrite` duplex byte
//! transport (TCP sockets, TLS streams, in-process `tokio::io::duplex`
//! loopbacks plug in directly). This module provides the local IPC flavor:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)

mod pipe;

pub use pipe::{connect, pipe_path, PipeListener, PipeStream};

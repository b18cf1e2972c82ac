//! Local IPC endpoints.
//!
//! - Unix: Unix Domain Socket ([`PipeStream`] is plain
//!   [`tokio::net::UnixStream`])
//! - Windows: Named Pipe (accepted and connected ends are distinct tokio
//!   types, unified behind the [`PipeStream`] enum)
//!
//! # Example
//!
//! ```ignore
//! use wiremux::transport::{self, PipeListener};
//!
//! let path = transport::pipe_path("worker");
//! let listener = PipeListener::bind(&path).await?;
//! let server_side = listener.accept().await?;
//! let client_side = transport::connect(&path).await?;
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

/// Per-process endpoint counter; paths stay unique without relying on
/// clock entropy.
static NEXT_ENDPOINT: AtomicU32 = AtomicU32::new(0);

/// Build a unique pipe path for this process.
///
/// `tag` names the endpoint in the path for diagnosability (keep it to
/// filename-safe characters). Uniqueness comes from the process id plus a
/// process-local counter.
///
/// Format:
/// - Unix: `/tmp/wiremux-{tag}.{pid}.{n}.sock`
/// - Windows: `\\.\pipe\wiremux-{tag}.{pid}.{n}`
pub fn pipe_path(tag: &str) -> String {
    let pid = std::process::id();
    let n = NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed);

    #[cfg(unix)]
    {
        format!("/tmp/wiremux-{tag}.{pid}.{n}.sock")
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\wiremux-{tag}.{pid}.{n}")
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod platform {
    use std::path::PathBuf;

    use tokio::net::{UnixListener, UnixStream};

    use crate::error::Result;

    /// A connected local IPC stream.
    ///
    /// On Unix this is the socket itself; no wrapper is needed since both
    /// ends share one type.
    pub type PipeStream = UnixStream;

    /// Listening end of a local IPC endpoint.
    ///
    /// The socket file is unlinked when the listener drops.
    pub struct PipeListener {
        listener: UnixListener,
        path: PathBuf,
    }

    impl PipeListener {
        /// Bind the endpoint, replacing any stale socket file left behind
        /// by a crashed process.
        pub async fn bind(path: &str) -> Result<Self> {
            let path = PathBuf::from(path);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let listener = UnixListener::bind(&path)?;
            Ok(Self { listener, path })
        }

        /// Accept one connection.
        pub async fn accept(&self) -> Result<PipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(stream)
        }

        /// The bound path.
        pub fn path(&self) -> &std::path::Path {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Connect to a listening endpoint.
    pub async fn connect(path: &str) -> Result<PipeStream> {
        Ok(UnixStream::connect(path).await?)
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod platform {
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    use crate::error::Result;

    /// `ERROR_PIPE_BUSY`: every server instance is taken; retry shortly.
    const PIPE_BUSY: i32 = 231;

    /// How many times `connect` retries a busy pipe before giving up.
    const BUSY_RETRIES: u32 = 50;

    /// A connected local IPC stream.
    ///
    /// Named pipes give the accepted and connected ends different tokio
    /// types; this enum unifies them behind one `AsyncRead + AsyncWrite`.
    pub enum PipeStream {
        Accepted(NamedPipeServer),
        Connected(NamedPipeClient),
    }

    /// Listening end of a local IPC endpoint.
    pub struct PipeListener {
        path: String,
        first: AtomicBool,
    }

    impl PipeListener {
        /// Bind the endpoint. The first pipe instance is created lazily on
        /// the first accept.
        pub async fn bind(path: &str) -> Result<Self> {
            Ok(Self {
                path: path.to_string(),
                first: AtomicBool::new(true),
            })
        }

        /// Accept one connection.
        pub async fn accept(&self) -> Result<PipeStream> {
            let first = self.first.swap(false, Ordering::SeqCst);
            let server = ServerOptions::new()
                .first_pipe_instance(first)
                .create(&self.path)?;

            server.connect().await?;
            Ok(PipeStream::Accepted(server))
        }

        /// The bound path.
        pub fn path(&self) -> &str {
            &self.path
        }
    }

    /// Connect to a listening endpoint, retrying while all pipe instances
    /// are busy.
    pub async fn connect(path: &str) -> Result<PipeStream> {
        let mut attempts = 0;
        loop {
            match ClientOptions::new().open(path) {
                Ok(client) => return Ok(PipeStream::Connected(client)),
                Err(e) if e.raw_os_error() == Some(PIPE_BUSY) && attempts < BUSY_RETRIES => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // Both ends are Unpin, so forwarding reduces to a variant match.
    macro_rules! with_pipe {
        ($self:ident, $pipe:ident => $call:expr) => {
            match $self.get_mut() {
                PipeStream::Accepted($pipe) => $call,
                PipeStream::Connected($pipe) => $call,
            }
        };
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            with_pipe!(self, pipe => Pin::new(pipe).poll_read(cx, buf))
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            with_pipe!(self, pipe => Pin::new(pipe).poll_write(cx, buf))
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            with_pipe!(self, pipe => Pin::new(pipe).poll_flush(cx))
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            with_pipe!(self, pipe => Pin::new(pipe).poll_shutdown(cx))
        }
    }
}

pub use platform::{connect, PipeListener, PipeStream};

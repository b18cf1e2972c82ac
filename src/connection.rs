//! Connection: the multiplexer that owns one byte transport.
//!
//! A connection splits its transport into a read half driven by a single
//! reader task (the demultiplex loop) and a write half drained by the
//! writer task. The reader is the sole consumer of inbound bytes and the
//! sole inbound-side mutator of the stream table; everything else talks to
//! a stream through its thread-safe contract.
//!
//! # Architecture
//!
//! ```text
//!                      ┌────────────────────────────────┐
//!                      │           Connection           │
//!                      ├────────────────────────────────┤
//!                      │  streams: Mutex<HashMap<u16,   │
//!                      │           Arc<RpcStream>>>     │
//!                      │  writer: WriterHandle          │
//!                      │  services: ServiceRegistry?    │
//!                      └──────────────┬─────────────────┘
//!                                     │
//!                               demux loop
//!                                     │
//!        ┌───────────────┬────────────┼──────────────┬───────────────┐
//!        │               │            │              │               │
//!   ping/close      NewStream    Payload/Trailer   Cancel      MethodNotFound
//!   echo control    bind method  route to stream   signal +    fail client
//!   frames          spawn handler via accept_frame removal     stream
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{oneshot, watch};

use crate::client::Client;
use crate::error::{Result, WiremuxError};
use crate::options::ConnectionOptions;
use crate::pool::BufferPool;
use crate::protocol::{
    control_header, flags, Frame, FrameBuffer, FrameKind, CONTROL_STREAM_ID,
};
use crate::server::{drive_handler, ServiceRegistry};
use crate::status::{Status, StatusCode};
use crate::stream::{Role, RpcStream, StreamReceivers};
use crate::writer::{spawn_writer_task, OutboundFrame, WriteFlags, WriterConfig, WriterHandle};

/// Read buffer size for the reader task.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A multiplexed connection over one bidirectional byte transport.
///
/// Create with [`Connection::client`] or [`Connection::server`]; both sides
/// may issue calls (a server connection simply also binds services).
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    is_client: bool,
    options: ConnectionOptions,
    pool: BufferPool,
    writer: WriterHandle,
    streams: Mutex<HashMap<u16, Arc<RpcStream>>>,
    next_stream_id: AtomicU16,
    services: Option<ServiceRegistry>,
    pending_pings: Mutex<VecDeque<oneshot::Sender<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Connection {
    /// Create the client side of a connection.
    pub fn client<T>(transport: T, options: ConnectionOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(transport, true, None, options)
    }

    /// Create the server side of a connection, binding the given services.
    pub fn server<T>(transport: T, services: ServiceRegistry, options: ConnectionOptions) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn(transport, false, Some(services), options)
    }

    fn spawn<T>(
        transport: T,
        is_client: bool,
        services: Option<ServiceRegistry>,
        options: ConnectionOptions,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (writer, writer_task) = spawn_writer_task(write_half, WriterConfig::from_options(&options));

        let pool = BufferPool::with_capacity(128, options.default_buffer_size);
        let (shutdown_tx, _) = watch::channel(false);

        // Locally initiated ids are odd on the client side and even on the
        // server side, so the two halves of a bidirectional connection
        // never collide in the shared table.
        let first_id = if is_client { 1 } else { 2 };

        let inner = Arc::new(ConnectionInner {
            is_client,
            options,
            pool,
            writer,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU16::new(first_id),
            services,
            pending_pings: Mutex::new(VecDeque::new()),
            shutdown_tx,
        });

        // Reader task: the demultiplex loop.
        let reader_inner = inner.clone();
        tokio::spawn(async move {
            match read_loop(&reader_inner, read_half).await {
                Ok(()) => reader_inner.teardown(Status::unavailable("connection closed")),
                Err(e) => {
                    tracing::error!(error = %e, "connection reader failed");
                    reader_inner.teardown(Status::unavailable(e.to_string()));
                }
            }
        });

        // Writer failures terminate the connection.
        let writer_inner = inner.clone();
        tokio::spawn(async move {
            match writer_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "connection writer failed");
                    writer_inner.teardown(Status::unavailable(e.to_string()));
                }
                Err(e) => {
                    tracing::error!(error = %e, "writer task aborted");
                    writer_inner.teardown(Status::unavailable("writer task aborted"));
                }
            }
        });

        Self { inner }
    }

    /// Call-invoker handle for issuing RPCs on this connection.
    pub fn client_handle(&self) -> Client {
        Client::new(self.inner.clone())
    }

    /// Round-trip a keep-alive ping.
    pub async fn ping(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending_pings.lock().push_back(tx);

        let header = control_header(
            FrameKind::Ping,
            self.inner.role().flag_bits(),
            CONTROL_STREAM_ID,
        );
        self.inner
            .writer
            .send(OutboundFrame::empty(&header, WriteFlags::FLUSH_AFTER))
            .await?;

        rx.await.map_err(|_| WiremuxError::ConnectionClosed)
    }

    /// Initiate the close handshake and wait for teardown.
    pub async fn close(&self) -> Result<()> {
        let header = control_header(
            FrameKind::Close,
            self.inner.role().flag_bits(),
            CONTROL_STREAM_ID,
        );
        // Best effort: the peer may already be gone.
        let _ = self
            .inner
            .writer
            .send(OutboundFrame::empty(&header, WriteFlags::FLUSH_AFTER))
            .await;
        self.closed().await;
        Ok(())
    }

    /// Wait until the connection has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.inner.shutdown_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Number of live streams in the table (diagnostics).
    pub fn active_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    /// Whether this side opened as the client.
    pub fn is_client(&self) -> bool {
        self.inner.is_client
    }
}

impl ConnectionInner {
    pub(crate) fn role(&self) -> Role {
        if self.is_client {
            Role::Client
        } else {
            Role::Server
        }
    }

    /// `true` when the frame was sent by the peer rather than echoed back
    /// by some intermediary; drives new-stream acceptance and control echo
    /// decisions.
    fn is_remote_originated(&self, frame: &Frame) -> bool {
        frame.is_from_server() == self.is_client
    }

    /// Allocate a stream id and insert a client-role stream for `method`.
    ///
    /// Ids wrap through the 16-bit space skipping 0 and live entries; the
    /// search is bounded by `max_concurrent_streams`.
    pub(crate) fn open_stream(
        &self,
        method: &str,
        method_type: crate::stream::MethodType,
    ) -> Result<(Arc<RpcStream>, StreamReceivers)> {
        if self.writer.is_closed() {
            return Err(WiremuxError::ConnectionClosed);
        }

        let mut streams = self.streams.lock();
        // Checked under the table lock: teardown flips the flag before
        // draining, so a stream inserted here is either seen by the drain
        // or never inserted.
        if *self.shutdown_tx.borrow() {
            return Err(WiremuxError::ConnectionClosed);
        }
        if streams.len() >= self.options.max_concurrent_streams {
            return Err(WiremuxError::Rpc(Status::new(
                StatusCode::ResourceExhausted,
                "too many concurrent calls",
            )));
        }

        for _ in 0..self.options.max_concurrent_streams {
            // Step by 2 to stay in this side's id parity class.
            let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
            if id == CONTROL_STREAM_ID || streams.contains_key(&id) {
                continue;
            }

            let (stream, receivers) = RpcStream::new(
                id,
                method,
                method_type,
                Role::Client,
                self.writer.clone(),
                self.pool.clone(),
            );
            streams.insert(id, stream.clone());
            return Ok((stream, receivers));
        }

        Err(WiremuxError::Rpc(Status::new(
            StatusCode::ResourceExhausted,
            "no free stream ids",
        )))
    }

    /// Remove a stream from the table. Idempotent.
    pub(crate) fn remove_stream(&self, id: u16) -> Option<Arc<RpcStream>> {
        self.streams.lock().remove(&id)
    }

    fn lookup_stream(&self, id: u16) -> Option<Arc<RpcStream>> {
        self.streams.lock().get(&id).cloned()
    }

    async fn send_control(&self, kind: FrameKind, kind_flags: u8, stream_id: u16) -> Result<()> {
        let header = control_header(kind, kind_flags, stream_id);
        self.writer
            .send(OutboundFrame::empty(&header, WriteFlags::FLUSH_AFTER))
            .await
    }

    /// Fail every stream and mark the connection closed. Idempotent.
    pub(crate) fn teardown(&self, status: Status) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        tracing::debug!(status = %status, "tearing down connection");

        let streams: Vec<_> = {
            let mut table = self.streams.lock();
            table.drain().map(|(_, stream)| stream).collect()
        };
        for stream in streams {
            stream.abort(status.clone());
        }

        // Dropped senders resolve any in-flight ping() with ConnectionClosed.
        self.pending_pings.lock().clear();
    }

    /// Route a payload or trailer frame to its stream.
    fn handle_stream_frame(&self, frame: Frame) {
        let id = frame.stream_id();
        if id == CONTROL_STREAM_ID {
            tracing::warn!(kind = ?frame.kind(), "data frame on control stream id; dropped");
            return;
        }

        let Some(stream) = self.lookup_stream(id) else {
            // Straggler after removal (cancel races are normal); drop.
            tracing::trace!(stream_id = id, kind = ?frame.kind(), "frame for unknown stream");
            return;
        };

        let is_trailer = frame.kind() == FrameKind::Trailer;
        match stream.try_accept_frame(&frame) {
            Ok(_adopted) => {
                // A trailer is terminal for the client side; the server
                // side is removed by its handler driver.
                if is_trailer {
                    self.remove_stream(id);
                }
            }
            Err(e) => {
                // Per-stream protocol violation: fail the stream, keep the
                // connection.
                tracing::warn!(
                    stream_id = id,
                    state = ?stream.state(),
                    error = %e,
                    "stream protocol violation"
                );
                stream.send_cancel_best_effort();
                stream.abort(Status::new(StatusCode::Internal, e.to_string()));
                self.remove_stream(id);
            }
        }
    }
}

/// Dispatch one inbound frame. Returns `true` when the reader loop should
/// exit (close handshake complete).
async fn handle_frame(inner: &Arc<ConnectionInner>, frame: Frame) -> Result<bool> {
    match frame.kind() {
        FrameKind::Close => {
            if !frame.is_response() && inner.is_remote_originated(&frame) {
                let _ = inner
                    .send_control(
                        FrameKind::Close,
                        inner.role().flag_bits() | flags::IS_RESPONSE,
                        CONTROL_STREAM_ID,
                    )
                    .await;
            }
            Ok(true)
        }

        FrameKind::Ping => {
            if frame.is_response() {
                if let Some(waiter) = inner.pending_pings.lock().pop_front() {
                    let _ = waiter.send(());
                }
            } else if inner.is_remote_originated(&frame) {
                inner
                    .send_control(
                        FrameKind::Ping,
                        inner.role().flag_bits() | flags::IS_RESPONSE,
                        CONTROL_STREAM_ID,
                    )
                    .await?;
            }
            Ok(false)
        }

        FrameKind::NewStream => {
            handle_new_stream(inner, frame).await?;
            Ok(false)
        }

        FrameKind::Payload | FrameKind::Trailer => {
            inner.handle_stream_frame(frame);
            Ok(false)
        }

        FrameKind::Cancel => {
            if frame.stream_id() != CONTROL_STREAM_ID {
                if let Some(stream) = inner.remove_stream(frame.stream_id()) {
                    tracing::debug!(stream_id = frame.stream_id(), "peer cancelled stream");
                    stream.abort(Status::cancelled());
                }
            }
            Ok(false)
        }

        FrameKind::MethodNotFound => {
            if let Some(stream) = inner.remove_stream(frame.stream_id()) {
                stream.abort(Status::unimplemented(stream.method()));
            }
            Ok(false)
        }
    }
}

/// Accept (or reject) a peer-initiated stream.
async fn handle_new_stream(inner: &Arc<ConnectionInner>, frame: Frame) -> Result<()> {
    let id = frame.stream_id();
    let reply_bits = inner.role().flag_bits();

    if inner.is_client {
        // Only servers accept streams; answer with a targeted cancel so
        // the peer does not wait forever.
        tracing::warn!(stream_id = id, "client received NewStream");
        return inner.send_control(FrameKind::Cancel, reply_bits, id).await;
    }
    if id == CONTROL_STREAM_ID || !inner.is_remote_originated(&frame) {
        tracing::warn!(stream_id = id, "malformed NewStream");
        return inner.send_control(FrameKind::Cancel, reply_bits, id).await;
    }
    if inner.streams.lock().contains_key(&id) {
        // Duplicate initiation is non-fatal: the prior stream continues,
        // the new attempt is cancelled.
        tracing::warn!(stream_id = id, "duplicate stream id on NewStream");
        return inner.send_control(FrameKind::Cancel, reply_bits, id).await;
    }

    let Ok(name) = std::str::from_utf8(frame.payload()) else {
        tracing::warn!(stream_id = id, "NewStream method name is not UTF-8");
        return inner
            .send_control(FrameKind::MethodNotFound, reply_bits, id)
            .await;
    };
    // Optional "{host}\0{method}" form: the method is the last part.
    let method = name.rsplit('\0').next().unwrap_or(name);

    let services = inner.services.as_ref().expect("server role has services");
    let Some(entry) = services.resolve(method) else {
        tracing::debug!(stream_id = id, method, "method not bound");
        return inner
            .send_control(FrameKind::MethodNotFound, reply_bits, id)
            .await;
    };

    let (stream, receivers) = RpcStream::new(
        id,
        method,
        entry.method_type,
        Role::Server,
        inner.writer.clone(),
        inner.pool.clone(),
    );

    inner.streams.lock().insert(id, stream.clone());

    tracing::debug!(stream_id = id, method, "accepted stream");
    tokio::spawn(drive_handler(inner.clone(), stream, receivers, entry));
    Ok(())
}

/// The demultiplex loop: reads transport bytes, parses frames, dispatches.
async fn read_loop<R>(inner: &Arc<ConnectionInner>, mut reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut shutdown = inner.shutdown_tx.subscribe();
    if *shutdown.borrow_and_update() {
        return Ok(());
    }

    loop {
        let n = tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => return Err(WiremuxError::Io(e)),
            },
            _ = shutdown.changed() => return Ok(()),
        };

        // A framing error here is structural: frame boundaries are lost,
        // so the error propagates and tears the connection down.
        for frame in frame_buffer.push(&buf[..n])? {
            if handle_frame(inner, frame).await? {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, Header};
    use bytes::Bytes;
    use tokio::io::{duplex, AsyncWriteExt};

    async fn read_frame(server: &mut tokio::io::DuplexStream) -> Frame {
        let mut buffer = FrameBuffer::new();
        let mut byte = [0u8; 256];
        loop {
            let n = AsyncReadExt::read(server, &mut byte).await.unwrap();
            assert!(n > 0);
            let mut frames = buffer.push(&byte[..n]).unwrap();
            if let Some(frame) = frames.pop() {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_ping_echoed_with_response_flag() {
        let (transport, mut peer) = duplex(4096);
        let _conn = Connection::client(transport, ConnectionOptions::default());

        // Peer (acting as server) pings; the client must echo.
        let ping = control_header(FrameKind::Ping, flags::FROM_SERVER, 0);
        peer.write_all(&build_frame(&ping, b"")).await.unwrap();

        let echo = read_frame(&mut peer).await;
        assert_eq!(echo.kind(), FrameKind::Ping);
        assert!(echo.is_response());
        assert!(!echo.is_from_server());
    }

    #[tokio::test]
    async fn test_ping_roundtrip_between_connections() {
        let (a, b) = duplex(4096);
        let client = Connection::client(a, ConnectionOptions::default());
        let _server = Connection::server(
            b,
            crate::server::ServiceBuilder::new().build(),
            ConnectionOptions::default(),
        );

        client.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_handshake() {
        let (a, b) = duplex(4096);
        let client = Connection::client(a, ConnectionOptions::default());
        let server = Connection::server(
            b,
            crate::server::ServiceBuilder::new().build(),
            ConnectionOptions::default(),
        );

        client.close().await.unwrap();
        server.closed().await;
        client.closed().await;
    }

    #[tokio::test]
    async fn test_client_rejects_new_stream() {
        let (transport, mut peer) = duplex(4096);
        let _conn = Connection::client(transport, ConnectionOptions::default());

        let new_stream = Header::new(FrameKind::NewStream, flags::FROM_SERVER, 9, 0, 5);
        peer.write_all(&build_frame(&new_stream, b"/x/yz"))
            .await
            .unwrap();

        let reply = read_frame(&mut peer).await;
        assert_eq!(reply.kind(), FrameKind::Cancel);
        assert_eq!(reply.stream_id(), 9);
    }

    #[tokio::test]
    async fn test_unknown_method_gets_method_not_found() {
        let (transport, mut peer) = duplex(4096);
        let _conn = Connection::server(
            transport,
            crate::server::ServiceBuilder::new().build(),
            ConnectionOptions::default(),
        );

        let new_stream = Header::new(FrameKind::NewStream, 0, 3, 0, 5);
        peer.write_all(&build_frame(&new_stream, b"/nope"))
            .await
            .unwrap();

        let reply = read_frame(&mut peer).await;
        assert_eq!(reply.kind(), FrameKind::MethodNotFound);
        assert_eq!(reply.stream_id(), 3);
        assert!(reply.is_from_server());
    }

    #[tokio::test]
    async fn test_unknown_stream_payload_is_dropped() {
        let (transport, mut peer) = duplex(4096);
        let conn = Connection::client(transport, ConnectionOptions::default());

        let orphan = Header::new(
            FrameKind::Payload,
            flags::FROM_SERVER | flags::END_ITEM,
            41,
            0,
            3,
        );
        peer.write_all(&build_frame(&orphan, b"who")).await.unwrap();

        // Stragglers are non-fatal: the connection must not tear down.
        let not_closed =
            tokio::time::timeout(std::time::Duration::from_millis(100), conn.closed()).await;
        assert!(not_closed.is_err());
        assert_eq!(conn.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_malformed_header_tears_down_connection() {
        let (transport, mut peer) = duplex(4096);
        let conn = Connection::client(transport, ConnectionOptions::default());

        // Unknown frame kind 0xEE is structural.
        peer.write_all(&[0xEE, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();

        conn.closed().await;
    }

    #[tokio::test]
    async fn test_transport_eof_fails_open_calls() {
        let (transport, peer) = duplex(4096);
        let conn = Connection::client(transport, ConnectionOptions::default());

        let (stream, receivers) = conn
            .inner
            .open_stream("/svc/echo", crate::stream::MethodType::Unary)
            .unwrap();
        stream.send_new_stream().await.unwrap();
        stream
            .send_message(Bytes::from_static(b"req"), true)
            .await
            .unwrap();

        drop(peer); // EOF

        let status = receivers.trailer.await.unwrap();
        assert_eq!(status.code, StatusCode::Unavailable);
        conn.closed().await;
    }

    #[tokio::test]
    async fn test_stream_id_allocation_skips_live_ids() {
        let (transport, _peer) = duplex(4096);
        let conn = Connection::client(transport, ConnectionOptions::default());

        let (first, _r1) = conn
            .inner
            .open_stream("/a", crate::stream::MethodType::Unary)
            .unwrap();
        let (second, _r2) = conn
            .inner
            .open_stream("/b", crate::stream::MethodType::Unary)
            .unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 3);

        // Wrap the counter back onto the live ids; allocation must skip
        // both live entries.
        conn.inner.next_stream_id.store(1, Ordering::Relaxed);
        let (third, _r3) = conn
            .inner
            .open_stream("/c", crate::stream::MethodType::Unary)
            .unwrap();
        assert_ne!(third.id(), 0);
        assert_ne!(third.id(), first.id());
        assert_ne!(third.id(), second.id());
        assert_eq!(conn.active_streams(), 3);
    }

    #[tokio::test]
    async fn test_client_ids_are_odd() {
        let (transport, _peer) = duplex(4096);
        let conn = Connection::client(transport, ConnectionOptions::default());

        for _ in 0..5 {
            let (stream, _recv) = conn
                .inner
                .open_stream("/svc/x", crate::stream::MethodType::Unary)
                .unwrap();
            assert_eq!(stream.id() % 2, 1, "client-initiated ids are odd");
        }
    }

    #[tokio::test]
    async fn test_open_stream_caps_concurrency() {
        let (transport, _peer) = duplex(4096);
        let conn = Connection::client(
            transport,
            ConnectionOptions {
                max_concurrent_streams: 2,
                ..Default::default()
            },
        );

        let _a = conn.inner.open_stream("/a", crate::stream::MethodType::Unary).unwrap();
        let _b = conn.inner.open_stream("/b", crate::stream::MethodType::Unary).unwrap();
        let err = conn
            .inner
            .open_stream("/c", crate::stream::MethodType::Unary)
            .unwrap_err();
        assert!(matches!(
            err.status().map(|s| s.code),
            Some(StatusCode::ResourceExhausted)
        ));
    }
}

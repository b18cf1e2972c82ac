//! Per-stream state machine.
//!
//! Each live call is one [`RpcStream`]: it owns the outbound sequence
//! counter and chunking of messages into size-capped `Payload` frames, the
//! inbound reassembly accumulator, the cancellation signal, and the
//! terminal-status plumbing. The multiplexer only needs the uniform
//! [`RpcStream::try_accept_frame`] and [`RpcStream::abort`] operations;
//! call-shape contracts (unary vs streaming) are enforced by the client
//! and server wrappers that hold the stream's receivers.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{Result, WiremuxError};
use crate::pool::BufferPool;
use crate::protocol::{
    control_header, flags, payload_header, Frame, FrameKind, Header, MAX_PAYLOAD_SIZE,
};
use crate::status::Status;
use crate::writer::{OutboundFrame, WriteFlags, WriterHandle};

/// The four call shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    /// One request, one response.
    Unary,
    /// Many requests, one response.
    ClientStreaming,
    /// One request, many responses.
    ServerStreaming,
    /// Independent request and response streams.
    Duplex,
}

impl MethodType {
    /// Whether the client half may carry more than one message.
    #[inline]
    pub fn client_streams(&self) -> bool {
        matches!(self, MethodType::ClientStreaming | MethodType::Duplex)
    }

    /// Whether the server half may carry more than one message.
    #[inline]
    pub fn server_streams(&self) -> bool {
        matches!(self, MethodType::ServerStreaming | MethodType::Duplex)
    }
}

/// Which side of the connection a stream object lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Kind-flag bits every frame sent by this side carries.
    #[inline]
    pub(crate) fn flag_bits(&self) -> u8 {
        match self {
            Role::Client => 0,
            Role::Server => flags::FROM_SERVER,
        }
    }
}

/// Lifecycle of a stream, derived from the two half-close markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Inbound reassembly state, mutated only by the connection's reader task.
#[derive(Debug)]
struct InboundState {
    /// Sequence id the next `Payload` frame must carry.
    next_sequence: u16,
    /// Partial message bytes awaiting an `END_ITEM` frame.
    accumulator: BytesMut,
    /// The peer closed its half (`END_ALL_ITEMS` or trailer).
    remote_done: bool,
    /// Completed-message channel; dropped when the remote half closes.
    messages: Option<mpsc::UnboundedSender<Bytes>>,
}

/// Receiving ends handed to the call/handler side of a stream.
///
/// The cancellation signal is not carried here; subscribe via
/// [`RpcStream::cancellation`].
#[derive(Debug)]
pub(crate) struct StreamReceivers {
    /// Completed inbound messages, in arrival order.
    pub messages: mpsc::UnboundedReceiver<Bytes>,
    /// Terminal status for the call.
    pub trailer: oneshot::Receiver<Status>,
}

/// One live logical call.
#[derive(Debug)]
pub(crate) struct RpcStream {
    id: u16,
    method: String,
    method_type: MethodType,
    role: Role,
    writer: WriterHandle,
    pool: BufferPool,
    /// Sequence for the next outbound Payload/Trailer frame.
    send_seq: AtomicU16,
    /// Local half closed (`END_ALL_ITEMS` or trailer sent).
    local_done: AtomicBool,
    /// Terminal status delivered (trailer seen, cancel, or teardown).
    finished: AtomicBool,
    inbound: Mutex<InboundState>,
    trailer_tx: Mutex<Option<oneshot::Sender<Status>>>,
    cancel_tx: watch::Sender<bool>,
}

impl RpcStream {
    /// Create a stream and the receivers for its consuming side.
    pub(crate) fn new(
        id: u16,
        method: impl Into<String>,
        method_type: MethodType,
        role: Role,
        writer: WriterHandle,
        pool: BufferPool,
    ) -> (Arc<Self>, StreamReceivers) {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (trailer_tx, trailer_rx) = oneshot::channel();
        let (cancel_tx, _) = watch::channel(false);

        let stream = Arc::new(Self {
            id,
            method: method.into(),
            method_type,
            role,
            writer,
            pool,
            send_seq: AtomicU16::new(0),
            local_done: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            inbound: Mutex::new(InboundState {
                next_sequence: 0,
                accumulator: BytesMut::new(),
                remote_done: false,
                messages: Some(messages_tx),
            }),
            trailer_tx: Mutex::new(Some(trailer_tx)),
            cancel_tx,
        });

        let receivers = StreamReceivers {
            messages: messages_rx,
            trailer: trailer_rx,
        };

        (stream, receivers)
    }

    /// Stream id.
    #[inline]
    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    /// Method full-name this stream was opened for.
    #[inline]
    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    /// Call shape.
    #[inline]
    pub(crate) fn method_type(&self) -> MethodType {
        self.method_type
    }

    /// A fresh subscription to the cancellation signal.
    pub(crate) fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Whether a terminal status has been delivered.
    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub(crate) fn state(&self) -> StreamState {
        if self.is_finished() {
            return StreamState::Closed;
        }
        let local = self.local_done.load(Ordering::Acquire);
        let remote = self.inbound.lock().remote_done;
        match (local, remote) {
            (false, false) => StreamState::Open,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (true, true) => StreamState::Closed,
        }
    }

    fn next_send_seq(&self) -> u16 {
        self.send_seq.fetch_add(1, Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Emit the `NewStream` frame carrying the UTF-8 method full-name.
    ///
    /// Always sequence 0; the payload counter starts after it.
    pub(crate) async fn send_new_stream(&self) -> Result<()> {
        let name = self.method.as_bytes();
        if name.len() > MAX_PAYLOAD_SIZE {
            return Err(WiremuxError::Protocol("method name too long".to_string()));
        }
        let header = Header::new(
            FrameKind::NewStream,
            self.role.flag_bits(),
            self.id,
            0,
            name.len() as u16,
        );
        let frame_bytes = self.frame_into_pool(&header, name);
        // Let the request payload that follows merge into the same write.
        self.writer
            .send(OutboundFrame::preframed(frame_bytes, WriteFlags::BUFFER_HINT))
            .await
    }

    /// Send one logical message, chunking payloads larger than a frame.
    ///
    /// `last` marks this as the final message of the local half
    /// (`END_ALL_ITEMS` on the closing chunk).
    pub(crate) async fn send_message(&self, payload: Bytes, last: bool) -> Result<()> {
        if self.local_done.load(Ordering::Acquire) {
            return Err(WiremuxError::Protocol(
                "message sent after local half-close".to_string(),
            ));
        }

        let role_bits = self.role.flag_bits();

        if payload.len() <= MAX_PAYLOAD_SIZE {
            // Single-frame fast path: header + payload staged contiguously
            // in one pooled lease.
            let mut kind_flags = role_bits | flags::END_ITEM;
            if last {
                kind_flags |= flags::END_ALL_ITEMS;
            }
            let header = payload_header(kind_flags, self.id, self.next_send_seq(), payload.len());
            let frame_bytes = self.frame_into_pool(&header, &payload);
            if last {
                self.local_done.store(true, Ordering::Release);
            }
            return self
                .writer
                .send(OutboundFrame::preframed(frame_bytes, WriteFlags::FLUSH_AFTER))
                .await;
        }

        // Multi-frame path: slice the caller's lease without copying.
        let mut offset = 0;
        while offset < payload.len() {
            let end = usize::min(offset + MAX_PAYLOAD_SIZE, payload.len());
            let chunk = payload.slice(offset..end);
            let final_chunk = end == payload.len();

            let mut kind_flags = role_bits;
            let mut write_flags = WriteFlags::BUFFER_HINT;
            if final_chunk {
                kind_flags |= flags::END_ITEM;
                write_flags = WriteFlags::FLUSH_AFTER;
                if last {
                    kind_flags |= flags::END_ALL_ITEMS;
                }
            }

            let header = payload_header(kind_flags, self.id, self.next_send_seq(), chunk.len());
            if final_chunk && last {
                self.local_done.store(true, Ordering::Release);
            }
            self.writer
                .send(OutboundFrame::new(&header, chunk, write_flags))
                .await?;

            offset = end;
        }

        Ok(())
    }

    /// Close the local half without a message: zero-length `Payload` with
    /// `END_ALL_ITEMS` only (no `END_ITEM`, so no empty message is implied).
    pub(crate) async fn send_half_close(&self) -> Result<()> {
        if self.local_done.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let header = payload_header(
            self.role.flag_bits() | flags::END_ALL_ITEMS,
            self.id,
            self.next_send_seq(),
            0,
        );
        self.writer
            .send(OutboundFrame::empty(&header, WriteFlags::FLUSH_AFTER))
            .await
    }

    /// Send the terminal status (server side). Implies `END_ALL_ITEMS`.
    pub(crate) async fn send_trailer(&self, status: &Status) -> Result<()> {
        let payload = status.encode();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WiremuxError::Protocol("status detail too long".to_string()));
        }
        let header = Header::new(
            FrameKind::Trailer,
            self.role.flag_bits() | flags::END_ALL_ITEMS,
            self.id,
            self.next_send_seq(),
            payload.len() as u16,
        );
        self.local_done.store(true, Ordering::Release);
        self.finished.store(true, Ordering::Release);
        self.writer
            .send(OutboundFrame::new(&header, payload, WriteFlags::FLUSH_AFTER))
            .await
    }

    /// Best-effort `Cancel` frame; silently dropped when the outbound
    /// queue is full or closed.
    pub(crate) fn send_cancel_best_effort(&self) {
        let header = control_header(FrameKind::Cancel, self.role.flag_bits(), self.id);
        let _ = self
            .writer
            .try_send(OutboundFrame::empty(&header, WriteFlags::FLUSH_AFTER));
    }

    /// Stage a contiguous header+payload frame in a pooled lease.
    fn frame_into_pool(&self, header: &Header, payload: &[u8]) -> Bytes {
        let mut buf = self.pool.get_sized(crate::protocol::HEADER_SIZE + payload.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(payload);
        buf.into_bytes()
    }

    // ------------------------------------------------------------------
    // Inbound (reader task only)
    // ------------------------------------------------------------------

    /// Admit an inbound frame.
    ///
    /// Returns `Ok(true)` when the frame's payload lease was adopted
    /// (forwarded without copy to the message channel). A protocol
    /// violation fails this stream only; the caller aborts it and keeps
    /// the connection alive.
    pub(crate) fn try_accept_frame(&self, frame: &Frame) -> Result<bool> {
        match frame.kind() {
            FrameKind::Payload => self.accept_payload(frame),
            FrameKind::Trailer => {
                self.accept_trailer(frame);
                Ok(false)
            }
            kind => Err(WiremuxError::Protocol(format!(
                "unexpected {kind:?} frame on stream {}",
                self.id
            ))),
        }
    }

    fn accept_payload(&self, frame: &Frame) -> Result<bool> {
        let mut inbound = self.inbound.lock();

        if inbound.remote_done {
            return Err(WiremuxError::Protocol(format!(
                "payload after end of stream {}",
                self.id
            )));
        }
        if frame.sequence_id() != inbound.next_sequence {
            return Err(WiremuxError::Protocol(format!(
                "stream {}: expected sequence {}, got {}",
                self.id,
                inbound.next_sequence,
                frame.sequence_id()
            )));
        }
        inbound.next_sequence = inbound.next_sequence.wrapping_add(1);

        let mut adopted = false;
        if frame.is_end_item() {
            let message = if inbound.accumulator.is_empty() {
                // Zero-copy forward: the decoder's lease moves to the
                // message channel, ref-count bumped, nothing copied.
                adopted = true;
                frame.payload.clone()
            } else {
                inbound.accumulator.extend_from_slice(&frame.payload);
                inbound.accumulator.split().freeze()
            };
            if let Some(tx) = &inbound.messages {
                let _ = tx.send(message);
            }
        } else {
            // A chunk without END_ITEM may only close the half when it
            // strands no message bytes.
            if frame.is_end_all_items()
                && (!inbound.accumulator.is_empty() || !frame.payload.is_empty())
            {
                return Err(WiremuxError::Protocol(format!(
                    "stream {}: half-close with partial message",
                    self.id
                )));
            }
            inbound.accumulator.extend_from_slice(&frame.payload);
        }

        if frame.is_end_all_items() {
            inbound.remote_done = true;
            // Dropping the sender lets the consumer drain then observe end.
            inbound.messages = None;
        }

        Ok(adopted)
    }

    fn accept_trailer(&self, frame: &Frame) {
        let status = Status::decode(frame.payload());
        {
            let mut inbound = self.inbound.lock();
            inbound.remote_done = true;
            inbound.messages = None;
        }
        self.finished.store(true, Ordering::Release);
        if let Some(tx) = self.trailer_tx.lock().take() {
            let _ = tx.send(status);
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Terminate the stream locally with the given status.
    ///
    /// Used for peer cancellation, method-not-found, connection teardown,
    /// and sequence violations. Idempotent.
    pub(crate) fn abort(&self, status: Status) {
        let _ = self.cancel_tx.send(true);
        {
            let mut inbound = self.inbound.lock();
            inbound.remote_done = true;
            inbound.messages = None;
        }
        self.finished.store(true, Ordering::Release);
        if let Some(tx) = self.trailer_tx.lock().take() {
            let _ = tx.send(status);
        }
    }
}

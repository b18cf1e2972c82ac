//! Dedicated writer task draining the outbound frame queue.
//!
//! The outbound queue is multi-producer, single-consumer: stream handlers
//! and the multiplexer loop enqueue concurrently through a cloned
//! [`WriterHandle`], and one task per connection drains frames to the
//! transport. This linearizes output (the peer observes frames in enqueue
//! order) and enables merging multiple frames into a single syscall via
//! vectored writes.
//!
//! # Architecture
//!
//! ```text
//! Stream 1 ─┐
//! Stream 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Transport
//! Mux loop ─┘
//! ```

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, WiremuxError};
use crate::options::ConnectionOptions;
use crate::protocol::{Header, HEADER_SIZE};

/// Maximum frames to merge into a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Interval between backpressure checks.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

bitflags! {
    /// Per-frame hints for the writer task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u8 {
        /// Permit coalescing this frame with queued neighbors.
        const BUFFER_HINT     = 0b0000_0001;
        /// Force a flush immediately after this frame.
        const FLUSH_AFTER     = 0b0000_0010;
        /// The payload buffer already starts with the 8 header bytes; do
        /// not emit the header separately.
        const HEADER_RESERVED = 0b0000_0100;
    }
}

/// A frame ready to be written to the transport.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header (ignored when `HEADER_RESERVED` is set).
    header: [u8; HEADER_SIZE],
    /// Payload bytes; the full frame bytes when `HEADER_RESERVED` is set.
    payload: Bytes,
    /// Writer hints.
    flags: WriteFlags,
}

impl OutboundFrame {
    /// Create a new outbound frame.
    #[inline]
    pub fn new(header: &Header, payload: Bytes, flags: WriteFlags) -> Self {
        debug_assert!(!flags.contains(WriteFlags::HEADER_RESERVED));
        Self {
            header: header.encode(),
            payload,
            flags,
        }
    }

    /// Create a new outbound frame with empty payload.
    #[inline]
    pub fn empty(header: &Header, flags: WriteFlags) -> Self {
        Self::new(header, Bytes::new(), flags)
    }

    /// Create an outbound frame whose buffer already contains the header.
    ///
    /// Used by senders that stage header and payload contiguously in one
    /// pooled buffer, so the writer emits a single slice with no copy.
    #[inline]
    pub fn preframed(frame_bytes: Bytes, flags: WriteFlags) -> Self {
        debug_assert!(frame_bytes.len() >= HEADER_SIZE);
        Self {
            header: [0u8; HEADER_SIZE],
            payload: frame_bytes,
            flags: flags | WriteFlags::HEADER_RESERVED,
        }
    }

    /// Total bytes this frame contributes on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        if self.flags.contains(WriteFlags::HEADER_RESERVED) {
            self.payload.len()
        } else {
            HEADER_SIZE + self.payload.len()
        }
    }

    #[inline]
    fn wants_flush(&self) -> bool {
        self.flags.contains(WriteFlags::FLUSH_AFTER)
    }

    #[inline]
    fn may_coalesce(&self) -> bool {
        self.flags.contains(WriteFlags::BUFFER_HINT)
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
    /// Byte budget per merged batch; `0` disables coalescing.
    pub output_buffer_size: usize,
    /// Whether frames may be merged into one underlying write at all.
    pub merge_writes: bool,
}

impl WriterConfig {
    /// Derive the writer configuration from connection options.
    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            channel_capacity: options.channel_capacity,
            max_pending_frames: options.max_pending_frames,
            backpressure_timeout: options.backpressure_timeout,
            output_buffer_size: options.output_buffer_size,
            merge_writes: options.merge_writes,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::from_options(&ConnectionOptions::default())
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; shared by every stream on the connection.
#[derive(Clone, Debug)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Pending frame count (for backpressure).
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Send a frame to the writer task.
    ///
    /// Waits while backpressure is active, timing out after the configured
    /// duration.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        // Increment pending count BEFORE sending
        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            WiremuxError::ConnectionClosed
        })
    }

    /// Try to send a frame without waiting.
    ///
    /// Best-effort path for cancel frames and teardown notifications.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(WiremuxError::BackpressureTimeout);
        }

        self.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => WiremuxError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => WiremuxError::ConnectionClosed,
            }
        })
    }

    /// Wait for backpressure to clear with timeout.
    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();

        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(WiremuxError::ConnectionClosed);
            }
            if start.elapsed() > self.timeout {
                return Err(WiremuxError::BackpressureTimeout);
            }

            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Get the current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Check whether the writer task is gone.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task runs until every `WriterHandle` is dropped (clean shutdown) or
/// a transport write fails (the `JoinHandle` resolves with the error, which
/// the connection propagates to every stream).
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending, config));

    (handle, task)
}

/// Main writer loop - receives frames and writes them to the transport.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
    config: WriterConfig,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let coalesce = config.merge_writes && config.output_buffer_size > 0;

    loop {
        // Wait for the first frame
        let first = match rx.recv().await {
            Some(f) => f,
            None => {
                // Channel closed, clean shutdown
                let _ = writer.flush().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut batch_bytes = first.size();
        let stop_after_first = !coalesce || !first.may_coalesce() || first.wants_flush();
        batch.push(first);

        // Collect additional ready frames (non-blocking) while the byte
        // budget holds and every frame consents to coalescing.
        if !stop_after_first {
            while batch.len() < MAX_BATCH_SIZE && batch_bytes < config.output_buffer_size {
                match rx.try_recv() {
                    Ok(frame) => {
                        batch_bytes += frame.size();
                        let stop = frame.wants_flush() || !frame.may_coalesce();
                        batch.push(frame);
                        if stop {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        }

        let batch_size = batch.len();
        write_batch(&mut writer, &batch).await?;

        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

/// Write a batch of frames using scatter/gather I/O (`write_vectored`).
///
/// Even a single frame benefits: header and payload go out in one syscall
/// instead of two.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        if !frame.flags.contains(WriteFlags::HEADER_RESERVED) {
            slices.push(IoSlice::new(&frame.header));
        }
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();

    // Fast path: a single vectored write covers the whole batch.
    let written = writer.write_vectored(&slices).await?;

    if written == total_size {
        writer.flush().await?;
        return Ok(());
    }

    if written == 0 {
        return Err(WiremuxError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    // Slow path: partial write, continue with the remaining bytes.
    let mut total_written = written;

    while total_written < total_size {
        let remaining_slices = build_remaining_slices(batch, total_written);
        if remaining_slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining_slices).await?;
        if written == 0 {
            return Err(WiremuxError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build the IoSlice array for the bytes left over after a partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        if !frame.flags.contains(WriteFlags::HEADER_RESERVED) {
            let header_start = skipped;
            let header_end = skipped + HEADER_SIZE;

            if skip_bytes < header_end {
                let start_in_header = skip_bytes.saturating_sub(header_start);
                slices.push(IoSlice::new(&frame.header[start_in_header..]));
            }
            skipped = header_end;
        }

        if !frame.payload.is_empty() {
            let payload_start = skipped;
            let payload_end = skipped + frame.payload.len();

            if skip_bytes < payload_end {
                let start_in_payload = skip_bytes.saturating_sub(payload_start);
                slices.push(IoSlice::new(&frame.payload[start_in_payload..]));
            }
            skipped = payload_end;
        }
    }

    slices
}

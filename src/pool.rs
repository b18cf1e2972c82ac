//! Ref-counted buffer pool backing frame payloads.
//!
//! Every outbound frame body is staged in a pooled buffer and then frozen
//! into a [`bytes::Bytes`] lease. The `Bytes` atomic ref-count is the lease
//! count: cloning preserves the lease, dropping disposes it, and when the
//! last clone drops the storage returns to the pool's free list. This is
//! what lets a frame be handed across tasks (decoder to stream accumulator
//! to writer) without copying.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use object_pool::Pool;

use crate::options::DEFAULT_BUFFER_SIZE;
use crate::protocol::{HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Default number of buffers kept on the free list.
const DEFAULT_POOL_CAPACITY: usize = 128;

/// Largest buffer the pool will ever need to serve: a full frame.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// A thread-safe pool of reusable payload buffers.
///
/// Cheaply cloneable; clones share the same free list.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<Vec<u8>>>,
    buffer_size: usize,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}

impl BufferPool {
    /// Create a pool with the default lease size (8 KiB) and capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Create a pool with custom capacity and lease size.
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        let pool = Pool::new(capacity, move || Vec::with_capacity(buffer_size));
        Self {
            pool: Arc::new(pool),
            buffer_size,
        }
    }

    /// Lease a buffer from the pool.
    ///
    /// The buffer is empty but pre-allocated to the pool's lease size. It
    /// returns to the free list when the lease (and every `Bytes` derived
    /// from it) has been dropped.
    pub fn get(&self) -> PooledBuf {
        let mut reusable = self
            .pool
            .pull_owned(|| Vec::with_capacity(self.buffer_size));

        // Pooled buffers come back in whatever state they were dropped.
        reusable.clear();

        PooledBuf {
            inner: PooledBufInner::Pooled(reusable),
        }
    }

    /// Lease a buffer sized for `len` bytes of content.
    ///
    /// Requests beyond the pool's lease size are served from the heap
    /// without touching the free list.
    pub fn get_sized(&self, len: usize) -> PooledBuf {
        debug_assert!(len <= MAX_FRAME_SIZE);
        if len <= self.buffer_size {
            self.get()
        } else {
            PooledBuf {
                inner: PooledBufInner::Unpooled(Vec::with_capacity(len)),
            }
        }
    }

    /// The configured lease size for this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// An outstanding buffer lease.
///
/// Transparent `Vec<u8>` access through `Deref`/`DerefMut`; dropping the
/// lease returns pooled storage to the free list.
pub struct PooledBuf {
    inner: PooledBufInner,
}

enum PooledBufInner {
    /// Normal case: storage from the pool.
    Pooled(object_pool::ReusableOwned<Vec<u8>>),
    /// Overflow case: heap storage for oversized content.
    Unpooled(Vec<u8>),
}

impl PooledBuf {
    /// Lease a buffer and copy `data` into it.
    pub fn from_slice(pool: &BufferPool, data: &[u8]) -> Self {
        let mut buf = pool.get_sized(data.len());
        buf.extend_from_slice(data);
        buf
    }

    /// Freeze this lease into a ref-counted `Bytes` without copying.
    ///
    /// Cloning the returned `Bytes` preserves the lease; dropping a clone
    /// disposes one reference; the storage goes back to the pool when the
    /// count reaches zero.
    pub fn into_bytes(self) -> bytes::Bytes {
        bytes::Bytes::from_owner(PooledBufOwner(Arc::new(self)))
    }

    /// Whether this lease uses pool storage (false for oversized content).
    pub fn is_pooled(&self) -> bool {
        matches!(self.inner, PooledBufInner::Pooled(_))
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        match &self.inner {
            PooledBufInner::Pooled(buf) => buf,
            PooledBufInner::Unpooled(vec) => vec,
        }
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.inner {
            PooledBufInner::Pooled(buf) => buf,
            PooledBufInner::Unpooled(vec) => vec,
        }
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        match &self.inner {
            PooledBufInner::Pooled(buf) => buf.as_slice(),
            PooledBufInner::Unpooled(vec) => vec.as_slice(),
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("is_pooled", &self.is_pooled())
            .finish()
    }
}

/// Wrapper giving `Arc<PooledBuf>` the `AsRef<[u8]>` shape that
/// `Bytes::from_owner` needs.
struct PooledBufOwner(Arc<PooledBuf>);

impl AsRef<[u8]> for PooledBufOwner {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

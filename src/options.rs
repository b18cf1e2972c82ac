//! Connection configuration.

use std::time::Duration;

/// Default write-coalescing budget in bytes.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 64 * 1024;

/// Default bound on the stream-id search when the 16-bit space wraps.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 1024;

/// Default initial lease size handed out by the buffer pool.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default outbound queue depth.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default maximum pending outbound frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a connection.
///
/// All fields have working defaults; construct with struct-update syntax:
///
/// ```
/// use wiremux::ConnectionOptions;
///
/// let options = ConnectionOptions {
///     merge_writes: false,
///     ..Default::default()
/// };
/// assert_eq!(options.max_concurrent_streams, 1024);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bytes of write coalescing per batch; `0` disables coalescing.
    pub output_buffer_size: usize,
    /// Permit the writer to merge multiple queued frames into one write.
    pub merge_writes: bool,
    /// Bounds the stream-id search on wrap; also the effective cap on
    /// simultaneously live calls issued by this side.
    pub max_concurrent_streams: usize,
    /// Initial lease size from the buffer pool.
    pub default_buffer_size: usize,
    /// Outbound queue depth.
    pub channel_capacity: usize,
    /// Maximum pending outbound frames before producers start waiting.
    pub max_pending_frames: usize,
    /// How long a producer waits for queue space before giving up.
    pub backpressure_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            merge_writes: true,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            default_buffer_size: DEFAULT_BUFFER_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

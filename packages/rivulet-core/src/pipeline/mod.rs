//! Pull-mode framed dataflow.
//!
//! All media transfer is expressed as a chain of producers drained one
//! frame at a time: a sink pulls from its source, which may itself pull
//! from an upstream source, down to the stage that actually produces
//! bytes. Backpressure is implicit (a stage with no downstream demand
//! makes no upstream demand) and every transfer completes through the
//! scheduler.
//!
//! # Buffer ownership
//!
//! The sink owns the destination buffer. A pull moves the [`FrameBuffer`]
//! by value down the chain; the deepest producing stage writes into it and
//! hands it back through the completion callback. At any instant exactly
//! one party can write to the buffer, and cancellation
//! ([`FramedSource::stop_getting_frames`]) returns it to the caller.
//! Filters that prepend a header reserve space at the front
//! ([`FrameBuffer::reserve_front`]) so upstream bytes land after the
//! header with no intermediate copy.
//!
//! # Delivery
//!
//! A pull completes exactly once: either with a frame or with
//! [`FrameDelivery::Closed`], the normal end-of-stream signal. Sources
//! never run the completion from inside `get_next_frame` itself; delivery
//! is deferred through the scheduler, which keeps callback stacks flat no
//! matter how long the chain gets.

pub mod byte_stream;
pub mod file_sink;
pub mod filter;
pub mod queue_source;
pub mod sink;

pub use byte_stream::{ByteStreamSource, MemoryBufferSource};
pub use file_sink::FileSink;
pub use filter::{FrameAccumulator, HeaderPrefixFilter};
pub use queue_source::{QueueProducer, QueuedFrameSource};
pub use sink::{ConsumeOutcome, FrameConsumer, MediaSink};

use std::time::{Duration, SystemTime};

use bytes::BytesMut;

/// Destination buffer for a pull.
///
/// Wraps the sink-owned allocation plus the current write offset. The
/// region at `[start..]` belongs to whichever stage currently holds the
/// buffer; bytes before `start` are reserved by downstream stages for
/// headers they will fill in on the way back up.
pub struct FrameBuffer {
    data: BytesMut,
    start: usize,
}

impl FrameBuffer {
    /// Allocates a zeroed buffer of `capacity` bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::zeroed(capacity),
            start: 0,
        }
    }

    /// Total allocation size, independent of the current offset.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes available to the stage currently holding the buffer.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.data.len() - self.start
    }

    /// Writable destination region for the producing stage.
    pub fn dest(&mut self) -> &mut [u8] {
        let start = self.start;
        &mut self.data[start..]
    }

    /// Reserves `n` bytes in front of the destination for a header the
    /// caller fills in after the upstream delivery.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `n` bytes remain; callers check
    /// [`max_size`](Self::max_size) first.
    pub fn reserve_front(&mut self, n: usize) {
        assert!(n <= self.max_size(), "header reservation exceeds buffer");
        self.start += n;
    }

    /// Releases a front reservation made with
    /// [`reserve_front`](Self::reserve_front).
    pub fn release_front(&mut self, n: usize) {
        assert!(n <= self.start, "releasing more than was reserved");
        self.start -= n;
    }

    /// The first `n` bytes of the destination region, for filling in a
    /// released header reservation.
    pub fn front_mut(&mut self, n: usize) -> &mut [u8] {
        let start = self.start;
        &mut self.data[start..start + n]
    }

    /// The delivered frame: `size` bytes at the current offset.
    #[must_use]
    pub fn frame(&self, size: usize) -> &[u8] {
        &self.data[self.start..self.start + size]
    }
}

/// Metadata delivered alongside a frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    /// Bytes written into the destination, at most its `max_size`.
    pub frame_size: usize,
    /// Bytes that did not fit. Nonzero truncation tells the consumer its
    /// buffer was too small for this frame; it is not an error.
    pub truncated_bytes: usize,
    /// Wall-clock timestamp of the frame, non-decreasing per source.
    pub presentation_time: SystemTime,
    /// Intended play time of the frame; zero when the source cannot know.
    pub duration: Duration,
}

/// How a pull completed.
pub enum FrameDelivery {
    /// A frame was written into the buffer.
    Frame(FrameInfo),
    /// End of stream: the source cannot produce another frame. Terminal
    /// and normal; not an error.
    Closed,
}

/// Completion callback for one pull. Consumed on delivery, so a pull
/// completes at most once by construction.
pub type FrameCallback = Box<dyn FnOnce(FrameBuffer, FrameDelivery)>;

/// An active object producing a finite, lazy sequence of frames on demand.
///
/// Implementations must deliver through the scheduler rather than from
/// inside `get_next_frame`, and must keep presentation times
/// non-decreasing.
pub trait FramedSource {
    /// Requests the next frame into `buffer`. Eventually `completion` runs
    /// from scheduler context with the buffer and either a frame or
    /// [`FrameDelivery::Closed`].
    ///
    /// # Panics
    ///
    /// Panics if a pull is already outstanding; silently accepting a
    /// second pull would corrupt buffer ownership.
    fn get_next_frame(&mut self, buffer: FrameBuffer, completion: FrameCallback);

    /// Cancels the outstanding pull, if any, without invoking its
    /// completion, and returns the reclaimed buffer. Safe to call when no
    /// pull is outstanding.
    fn stop_getting_frames(&mut self) -> Option<FrameBuffer>;

    /// Whether a pull is outstanding.
    fn is_currently_awaiting_data(&self) -> bool;

    /// Size hint: the largest frame this source delivers; 0 = unknown.
    fn max_frame_size(&self) -> usize {
        0
    }
}

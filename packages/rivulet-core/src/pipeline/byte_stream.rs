//! Byte-stream sources: unstructured bytes chunked into frames.
//!
//! Both sources here deliver "as many bytes as fit" per pull (optionally
//! capped at a preferred frame size), so they never truncate. With a
//! per-frame play time configured they pace presentation times forward by
//! one frame duration per delivery; otherwise each frame is stamped with
//! the wall clock, clamped so timestamps never run backwards.
//!
//! `ByteStreamSource` reads regular files with ordinary blocking reads on
//! the loop thread; regular files are always "ready", so there is nothing
//! to wait on and the read stalls only on storage itself.

use std::cell::RefCell;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::env::Environment;
use crate::error::{PipelineError, PipelineResult};

use super::{FrameBuffer, FrameCallback, FrameDelivery, FrameInfo, FramedSource};

/// The pull currently parked on a source, waiting for delivery.
struct PendingPull {
    buffer: FrameBuffer,
    completion: FrameCallback,
}

/// Presentation-time pacing shared by the byte-stream sources.
struct Pacing {
    play_time_per_frame: Duration,
    prev_presentation: Option<SystemTime>,
}

impl Pacing {
    fn new(play_time_per_frame: Duration) -> Self {
        Self {
            play_time_per_frame,
            prev_presentation: None,
        }
    }

    /// Timestamp for the next frame: paced forward from the previous frame
    /// when a play time is configured, wall clock (never backwards)
    /// otherwise.
    fn next_presentation(&mut self) -> (SystemTime, Duration) {
        let now = SystemTime::now();
        let presentation = match self.prev_presentation {
            None => now,
            Some(prev) if self.play_time_per_frame.is_zero() => now.max(prev),
            Some(prev) => prev + self.play_time_per_frame,
        };
        self.prev_presentation = Some(presentation);
        (presentation, self.play_time_per_frame)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryBufferSource
// ─────────────────────────────────────────────────────────────────────────────

struct MemoryInner {
    env: Environment,
    data: Bytes,
    position: usize,
    preferred_frame_size: usize,
    pacing: Pacing,
    pending: Option<PendingPull>,
}

/// Source that serves frames out of an in-memory byte region.
pub struct MemoryBufferSource {
    inner: Rc<RefCell<MemoryInner>>,
}

impl MemoryBufferSource {
    pub fn new(env: &Environment, data: Bytes) -> Self {
        Self {
            inner: Rc::new(RefCell::new(MemoryInner {
                env: env.clone(),
                data,
                position: 0,
                preferred_frame_size: 0,
                pacing: Pacing::new(Duration::ZERO),
                pending: None,
            })),
        }
    }

    /// Caps each delivered frame at `size` bytes (0 = fill the buffer).
    #[must_use]
    pub fn with_preferred_frame_size(self, size: usize) -> Self {
        self.inner.borrow_mut().preferred_frame_size = size;
        self
    }

    /// Paces presentation times by `play_time` per frame and reports it as
    /// each frame's duration.
    #[must_use]
    pub fn with_play_time_per_frame(self, play_time: Duration) -> Self {
        self.inner.borrow_mut().pacing.play_time_per_frame = play_time;
        self
    }

    fn deliver(weak: Weak<RefCell<MemoryInner>>) {
        let Some(cell) = weak.upgrade() else {
            return;
        };
        let (pull, delivery) = {
            let mut inner = cell.borrow_mut();
            let Some(mut pull) = inner.pending.take() else {
                return; // cancelled between scheduling and delivery
            };
            if inner.position >= inner.data.len() {
                (pull, FrameDelivery::Closed)
            } else {
                let mut frame_size = (inner.data.len() - inner.position).min(pull.buffer.max_size());
                if inner.preferred_frame_size > 0 {
                    frame_size = frame_size.min(inner.preferred_frame_size);
                }
                let position = inner.position;
                pull.buffer.dest()[..frame_size]
                    .copy_from_slice(&inner.data[position..position + frame_size]);
                inner.position += frame_size;
                let (presentation_time, duration) = inner.pacing.next_presentation();
                (
                    pull,
                    FrameDelivery::Frame(FrameInfo {
                        frame_size,
                        truncated_bytes: 0,
                        presentation_time,
                        duration,
                    }),
                )
            }
        };
        (pull.completion)(pull.buffer, delivery);
    }
}

impl FramedSource for MemoryBufferSource {
    fn get_next_frame(&mut self, buffer: FrameBuffer, completion: FrameCallback) {
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.pending.is_none(),
            "get_next_frame called while a pull is outstanding"
        );
        inner.pending = Some(PendingPull { buffer, completion });
        let weak = Rc::downgrade(&self.inner);
        inner
            .env
            .scheduler()
            .schedule_delayed_task(Duration::ZERO, move || Self::deliver(weak));
    }

    fn stop_getting_frames(&mut self) -> Option<FrameBuffer> {
        self.inner
            .borrow_mut()
            .pending
            .take()
            .map(|pull| pull.buffer)
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.inner.borrow().pending.is_some()
    }

    fn max_frame_size(&self) -> usize {
        self.inner.borrow().preferred_frame_size
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ByteStreamSource
// ─────────────────────────────────────────────────────────────────────────────

struct FileInner {
    env: Environment,
    file: File,
    preferred_frame_size: usize,
    pacing: Pacing,
    /// Bytes still allowed out of the file; `None` = unlimited.
    remaining_limit: Option<u64>,
    /// Set once EOF or a read error has been delivered; all later pulls
    /// close immediately.
    closed: bool,
    pending: Option<PendingPull>,
}

/// File-backed byte source.
pub struct ByteStreamSource {
    inner: Rc<RefCell<FileInner>>,
}

impl std::fmt::Debug for ByteStreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStreamSource").finish()
    }
}

impl ByteStreamSource {
    /// Opens `path` for streaming.
    pub fn open(env: &Environment, path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| PipelineError::OpenFile {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!("[ByteStream] opened {}", path.display());
        Ok(Self::from_file(env, file))
    }

    /// Wraps an already-open file.
    pub fn from_file(env: &Environment, file: File) -> Self {
        Self {
            inner: Rc::new(RefCell::new(FileInner {
                env: env.clone(),
                file,
                preferred_frame_size: 0,
                pacing: Pacing::new(Duration::ZERO),
                remaining_limit: None,
                closed: false,
                pending: None,
            })),
        }
    }

    /// Caps each delivered frame at `size` bytes (0 = fill the buffer).
    #[must_use]
    pub fn with_preferred_frame_size(self, size: usize) -> Self {
        self.inner.borrow_mut().preferred_frame_size = size;
        self
    }

    /// Paces presentation times by `play_time` per frame and reports it as
    /// each frame's duration.
    #[must_use]
    pub fn with_play_time_per_frame(self, play_time: Duration) -> Self {
        self.inner.borrow_mut().pacing.play_time_per_frame = play_time;
        self
    }

    /// Stops the stream after `limit` bytes even if the file is longer.
    #[must_use]
    pub fn with_byte_limit(self, limit: u64) -> Self {
        self.inner.borrow_mut().remaining_limit = Some(limit);
        self
    }

    fn deliver(weak: Weak<RefCell<FileInner>>) {
        let Some(cell) = weak.upgrade() else {
            return;
        };
        let (pull, delivery) = {
            let mut inner = cell.borrow_mut();
            let Some(mut pull) = inner.pending.take() else {
                return; // cancelled between scheduling and delivery
            };

            let mut want = pull.buffer.max_size();
            if inner.preferred_frame_size > 0 {
                want = want.min(inner.preferred_frame_size);
            }
            if let Some(limit) = inner.remaining_limit {
                want = want.min(limit as usize);
            }

            if inner.closed || want == 0 {
                inner.closed = true;
                (pull, FrameDelivery::Closed)
            } else {
                let read = {
                    let dest = &mut pull.buffer.dest()[..want];
                    inner.file.read(dest)
                };
                match read {
                    Ok(0) => {
                        inner.closed = true;
                        (pull, FrameDelivery::Closed)
                    }
                    Ok(frame_size) => {
                        if let Some(limit) = inner.remaining_limit.as_mut() {
                            *limit -= frame_size as u64;
                        }
                        let (presentation_time, duration) = inner.pacing.next_presentation();
                        (
                            pull,
                            FrameDelivery::Frame(FrameInfo {
                                frame_size,
                                truncated_bytes: 0,
                                presentation_time,
                                duration,
                            }),
                        )
                    }
                    Err(err) => {
                        log::warn!("[ByteStream] read failed: {err}");
                        inner.env.set_result_msg(format!("file read failed: {err}"));
                        inner.closed = true;
                        (pull, FrameDelivery::Closed)
                    }
                }
            }
        };
        (pull.completion)(pull.buffer, delivery);
    }
}

impl FramedSource for ByteStreamSource {
    fn get_next_frame(&mut self, buffer: FrameBuffer, completion: FrameCallback) {
        let mut inner = self.inner.borrow_mut();
        assert!(
            inner.pending.is_none(),
            "get_next_frame called while a pull is outstanding"
        );
        inner.pending = Some(PendingPull { buffer, completion });
        let weak = Rc::downgrade(&self.inner);
        inner
            .env
            .scheduler()
            .schedule_delayed_task(Duration::ZERO, move || Self::deliver(weak));
    }

    fn stop_getting_frames(&mut self) -> Option<FrameBuffer> {
        self.inner
            .borrow_mut()
            .pending
            .take()
            .map(|pull| pull.buffer)
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.inner.borrow().pending.is_some()
    }

    fn max_frame_size(&self) -> usize {
        self.inner.borrow().preferred_frame_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;

    use crate::scheduler::TaskScheduler;

    fn test_env() -> Environment {
        Environment::new(TaskScheduler::new().unwrap())
    }

    /// Pulls one frame, stepping the loop until delivery lands.
    fn pull_one(env: &Environment, source: &mut dyn FramedSource, capacity: usize) -> (FrameBuffer, FrameDelivery) {
        let result: Rc<RefCell<Option<(FrameBuffer, FrameDelivery)>>> = Rc::new(RefCell::new(None));
        let slot = result.clone();
        source.get_next_frame(
            FrameBuffer::with_capacity(capacity),
            Box::new(move |buffer, delivery| {
                *slot.borrow_mut() = Some((buffer, delivery));
            }),
        );
        while result.borrow().is_none() {
            env.scheduler().single_step(Some(Duration::from_millis(10))).unwrap();
        }
        Rc::try_unwrap(result).ok().unwrap().into_inner().unwrap()
    }

    fn expect_frame(delivery: FrameDelivery) -> FrameInfo {
        match delivery {
            FrameDelivery::Frame(info) => info,
            FrameDelivery::Closed => panic!("expected a frame, got closure"),
        }
    }

    #[test]
    fn memory_source_chunks_by_preferred_size() {
        let env = test_env();
        let mut source =
            MemoryBufferSource::new(&env, Bytes::from(vec![7u8; 10])).with_preferred_frame_size(4);

        let (buffer, delivery) = pull_one(&env, &mut source, 64);
        let info = expect_frame(delivery);
        assert_eq!(info.frame_size, 4);
        assert_eq!(buffer.frame(4), &[7, 7, 7, 7]);

        let (_, delivery) = pull_one(&env, &mut source, 64);
        assert_eq!(expect_frame(delivery).frame_size, 4);
        let (_, delivery) = pull_one(&env, &mut source, 64);
        assert_eq!(expect_frame(delivery).frame_size, 2);

        let (_, delivery) = pull_one(&env, &mut source, 64);
        assert!(matches!(delivery, FrameDelivery::Closed));
        // Exhausted sources keep reporting closure.
        let (_, delivery) = pull_one(&env, &mut source, 64);
        assert!(matches!(delivery, FrameDelivery::Closed));
    }

    #[test]
    fn pull_exclusivity_is_observable() {
        let env = test_env();
        let mut source = MemoryBufferSource::new(&env, Bytes::from_static(b"abc"));
        assert!(!source.is_currently_awaiting_data());

        source.get_next_frame(FrameBuffer::with_capacity(8), Box::new(|_, _| {}));
        assert!(source.is_currently_awaiting_data());

        env.scheduler().single_step(Some(Duration::ZERO)).unwrap();
        assert!(!source.is_currently_awaiting_data());
    }

    #[test]
    #[should_panic(expected = "pull is outstanding")]
    fn double_pull_panics() {
        let env = test_env();
        let mut source = MemoryBufferSource::new(&env, Bytes::from_static(b"abc"));
        source.get_next_frame(FrameBuffer::with_capacity(8), Box::new(|_, _| {}));
        source.get_next_frame(FrameBuffer::with_capacity(8), Box::new(|_, _| {}));
    }

    #[test]
    fn stop_getting_frames_reclaims_the_buffer() {
        let env = test_env();
        let mut source = MemoryBufferSource::new(&env, Bytes::from_static(b"abc"));
        let delivered = Rc::new(Cell::new(false));
        let flag = delivered.clone();
        source.get_next_frame(
            FrameBuffer::with_capacity(8),
            Box::new(move |_, _| flag.set(true)),
        );

        let reclaimed = source.stop_getting_frames();
        assert!(reclaimed.is_some());
        assert!(!source.is_currently_awaiting_data());

        // The queued delivery task must not fire the dropped completion.
        env.scheduler().single_step(Some(Duration::ZERO)).unwrap();
        assert!(!delivered.get());
    }

    #[test]
    fn paced_presentation_times_advance_by_play_time() {
        let env = test_env();
        let play_time = Duration::from_millis(20);
        let mut source = MemoryBufferSource::new(&env, Bytes::from(vec![0u8; 8]))
            .with_preferred_frame_size(4)
            .with_play_time_per_frame(play_time);

        let (_, first) = pull_one(&env, &mut source, 64);
        let first = expect_frame(first);
        let (_, second) = pull_one(&env, &mut source, 64);
        let second = expect_frame(second);

        assert_eq!(first.duration, play_time);
        assert_eq!(
            second.presentation_time.duration_since(first.presentation_time).unwrap(),
            play_time
        );
    }

    #[test]
    fn unpaced_presentation_times_never_run_backwards() {
        let env = test_env();
        let mut source =
            MemoryBufferSource::new(&env, Bytes::from(vec![0u8; 8])).with_preferred_frame_size(4);

        let (_, first) = pull_one(&env, &mut source, 64);
        let (_, second) = pull_one(&env, &mut source, 64);
        let first = expect_frame(first);
        let second = expect_frame(second);
        assert!(second.presentation_time >= first.presentation_time);
    }

    #[test]
    fn file_source_streams_the_whole_file() {
        let env = test_env();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[9u8; 100]).unwrap();
        tmp.flush().unwrap();

        let mut source = ByteStreamSource::open(&env, tmp.path())
            .unwrap()
            .with_preferred_frame_size(40);

        let mut total = 0;
        loop {
            let (_, delivery) = pull_one(&env, &mut source, 64);
            match delivery {
                FrameDelivery::Frame(info) => total += info.frame_size,
                FrameDelivery::Closed => break,
            }
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn file_source_honors_byte_limit() {
        let env = test_env();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[1u8; 100]).unwrap();
        tmp.flush().unwrap();

        let mut source = ByteStreamSource::open(&env, tmp.path())
            .unwrap()
            .with_byte_limit(25);

        let (_, delivery) = pull_one(&env, &mut source, 64);
        assert_eq!(expect_frame(delivery).frame_size, 25);
        let (_, delivery) = pull_one(&env, &mut source, 64);
        assert!(matches!(delivery, FrameDelivery::Closed));
    }

    #[test]
    fn open_missing_file_reports_the_path() {
        let env = test_env();
        let err = ByteStreamSource::open(&env, "/no/such/rivulet-input").unwrap_err();
        assert!(err.to_string().contains("/no/such/rivulet-input"));
    }
}

//! File-writing sink behavior.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::Bytes;

use crate::error::{PipelineError, PipelineResult};

use super::{ConsumeOutcome, FrameConsumer, FrameInfo};

/// Default destination buffer size in bytes, sized for typical compressed
/// media frames.
pub const DEFAULT_BUFFER_SIZE: usize = 20_000;

/// Writes every delivered frame to a file.
///
/// An optional fixed prefix goes in front of each frame (framing marks,
/// sync words, and the like). An optional byte limit finishes playback
/// once enough has been written. Pair with [`MediaSink::new`]:
///
/// ```ignore
/// let sink = MediaSink::new(&env, Box::new(FileSink::create("out.bin")?));
/// ```
///
/// [`MediaSink::new`]: super::MediaSink::new
pub struct FileSink {
    writer: BufWriter<File>,
    buffer_size: usize,
    frame_prefix: Option<Bytes>,
    byte_limit: Option<u64>,
    bytes_written: u64,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink").finish()
    }
}

impl FileSink {
    /// Creates (truncating) the output file at `path`.
    pub fn create(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| PipelineError::OpenFile {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!("[FileSink] writing to {}", path.display());
        Ok(Self::from_file(file))
    }

    /// Wraps an already-open file.
    pub fn from_file(file: File) -> Self {
        Self {
            writer: BufWriter::new(file),
            buffer_size: DEFAULT_BUFFER_SIZE,
            frame_prefix: None,
            byte_limit: None,
            bytes_written: 0,
        }
    }

    /// Sets the destination buffer size handed to the source chain.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Writes `prefix` in front of every frame.
    #[must_use]
    pub fn with_frame_prefix(mut self, prefix: Bytes) -> Self {
        self.frame_prefix = Some(prefix);
        self
    }

    /// Finishes playback once `limit` frame bytes have been written.
    #[must_use]
    pub fn with_byte_limit(mut self, limit: u64) -> Self {
        self.byte_limit = Some(limit);
        self
    }

    /// Total frame bytes written so far (prefixes excluded).
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl FrameConsumer for FileSink {
    fn consume_frame(&mut self, frame: &[u8], info: &FrameInfo) -> ConsumeOutcome {
        if info.truncated_bytes > 0 {
            log::warn!(
                "[FileSink] frame lost {} bytes to truncation; consider a larger buffer",
                info.truncated_bytes
            );
        }

        if let Some(prefix) = &self.frame_prefix {
            if let Err(err) = self.writer.write_all(prefix) {
                log::warn!("[FileSink] prefix write failed: {err}");
                return ConsumeOutcome::Finished;
            }
        }
        if let Err(err) = self.writer.write_all(frame) {
            log::warn!("[FileSink] frame write failed: {err}");
            return ConsumeOutcome::Finished;
        }
        self.bytes_written += frame.len() as u64;

        if let Some(limit) = self.byte_limit {
            if self.bytes_written >= limit {
                log::info!("[FileSink] byte limit reached after {} bytes", self.bytes_written);
                return ConsumeOutcome::Finished;
            }
        }
        ConsumeOutcome::Continue
    }

    fn buffer_capacity(&self) -> usize {
        self.buffer_size
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(err) = self.writer.flush() {
            log::warn!("[FileSink] final flush failed: {err}");
        }
    }
}

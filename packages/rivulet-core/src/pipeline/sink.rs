//! Media sinks: consumers that drain a bound source chain.
//!
//! [`MediaSink`] owns the pull-loop machinery: binding, the destination
//! buffer, the continue-after-each-frame cycle, stop/resume, and the
//! exactly-once completion callback. What to *do* with each frame is a
//! [`FrameConsumer`] trait object, so concrete sinks stay small.
//!
//! Ownership runs strictly downstream: the sink owns the source chain and
//! nothing points back up, so unbinding on stop or closure tears the chain
//! down cleanly.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::env::Environment;
use crate::error::{PipelineError, PipelineResult};

use super::{FrameBuffer, FrameCallback, FrameDelivery, FrameInfo, FramedSource};

/// What a consumer wants after handling a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Pull the next frame.
    Continue,
    /// Stop here; the sink completes as if the source had ended.
    Finished,
}

/// Per-frame behavior of a concrete sink.
pub trait FrameConsumer {
    /// Handles one delivered frame.
    fn consume_frame(&mut self, frame: &[u8], info: &FrameInfo) -> ConsumeOutcome;

    /// Size of the destination buffer the sink should allocate.
    fn buffer_capacity(&self) -> usize;
}

struct SinkShared {
    env: Environment,
    source: RefCell<Option<Box<dyn FramedSource>>>,
    consumer: RefCell<Box<dyn FrameConsumer>>,
    buffer: RefCell<Option<FrameBuffer>>,
    on_done: RefCell<Option<Box<dyn FnOnce()>>>,
    playing: Cell<bool>,
}

impl SinkShared {
    /// Issues the next pull unless playback has ended meanwhile.
    fn continue_playing(shared: &Rc<SinkShared>) {
        if !shared.playing.get() {
            return;
        }
        let buffer = shared
            .buffer
            .borrow_mut()
            .take()
            .expect("playing sink must hold its buffer between pulls");
        let on_delivery: FrameCallback = {
            let shared = shared.clone();
            Box::new(move |buffer, delivery| SinkShared::on_delivery(shared, buffer, delivery))
        };
        shared
            .source
            .borrow_mut()
            .as_mut()
            .expect("playing sink must have a bound source")
            .get_next_frame(buffer, on_delivery);
    }

    fn on_delivery(shared: Rc<SinkShared>, buffer: FrameBuffer, delivery: FrameDelivery) {
        if !shared.playing.get() {
            // Stopped while the delivery was in flight; keep the buffer.
            *shared.buffer.borrow_mut() = Some(buffer);
            return;
        }
        match delivery {
            FrameDelivery::Closed => {
                log::debug!("[Sink] source closed, playback complete");
                *shared.buffer.borrow_mut() = Some(buffer);
                Self::finish(&shared);
            }
            FrameDelivery::Frame(info) => {
                let outcome = shared
                    .consumer
                    .borrow_mut()
                    .consume_frame(buffer.frame(info.frame_size), &info);
                *shared.buffer.borrow_mut() = Some(buffer);
                match outcome {
                    ConsumeOutcome::Continue => Self::continue_playing(&shared),
                    ConsumeOutcome::Finished => {
                        log::debug!("[Sink] consumer finished, playback complete");
                        Self::finish(&shared);
                    }
                }
            }
        }
    }

    /// Ends playback normally: fires `on_done` exactly once.
    fn finish(shared: &Rc<SinkShared>) {
        shared.playing.set(false);
        // Take the callback out before invoking so `on_done` may restart
        // playback without tripping over a live borrow.
        let on_done = shared.on_done.borrow_mut().take();
        if let Some(on_done) = on_done {
            on_done();
        }
    }

    /// Halts playback without firing `on_done`; reclaims any in-flight
    /// buffer. The binding survives so playback can be restarted.
    fn stop(&self) {
        if !self.playing.get() {
            return;
        }
        self.playing.set(false);
        self.on_done.borrow_mut().take();
        if let Some(source) = self.source.borrow_mut().as_mut() {
            if let Some(buffer) = source.stop_getting_frames() {
                *self.buffer.borrow_mut() = Some(buffer);
            }
        }
    }
}

/// A consumer that repeatedly pulls from one bound source.
///
/// Dropping a playing sink stops it first, which cancels the outstanding
/// pull before the source chain is released.
pub struct MediaSink {
    shared: Rc<SinkShared>,
}

impl MediaSink {
    pub fn new(env: &Environment, consumer: Box<dyn FrameConsumer>) -> Self {
        Self {
            shared: Rc::new(SinkShared {
                env: env.clone(),
                source: RefCell::new(None),
                consumer: RefCell::new(consumer),
                buffer: RefCell::new(None),
                on_done: RefCell::new(None),
                playing: Cell::new(false),
            }),
        }
    }

    /// Binds `source` and starts pulling. `on_done` fires exactly once,
    /// from scheduler context, when the source ends or the consumer
    /// finishes, but never after [`stop_playing`](Self::stop_playing).
    pub fn start_playing(
        &mut self,
        source: Box<dyn FramedSource>,
        on_done: impl FnOnce() + 'static,
    ) -> PipelineResult<()> {
        if self.shared.playing.get() {
            self.shared
                .env
                .set_result_msg("start_playing on a sink that is already playing");
            return Err(PipelineError::SinkAlreadyPlaying);
        }
        *self.shared.source.borrow_mut() = Some(source);
        *self.shared.on_done.borrow_mut() = Some(Box::new(on_done));
        if self.shared.buffer.borrow().is_none() {
            let capacity = self.shared.consumer.borrow().buffer_capacity();
            *self.shared.buffer.borrow_mut() = Some(FrameBuffer::with_capacity(capacity));
        }
        self.shared.playing.set(true);
        SinkShared::continue_playing(&self.shared);
        Ok(())
    }

    /// Resumes pulling from the source bound by an earlier
    /// [`start_playing`](Self::start_playing).
    pub fn resume_playing(&mut self, on_done: impl FnOnce() + 'static) -> PipelineResult<()> {
        if self.shared.playing.get() {
            return Err(PipelineError::SinkAlreadyPlaying);
        }
        let Some(source) = self.shared.source.borrow_mut().take() else {
            self.shared.env.set_result_msg("resume_playing on an unbound sink");
            return Err(PipelineError::SinkNotBound);
        };
        self.start_playing(source, on_done)
    }

    /// Halts pulling without firing `on_done`. Idempotent; the binding is
    /// kept so playback may resume.
    pub fn stop_playing(&mut self) {
        self.shared.stop();
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.get()
    }

    /// Releases the bound source chain, stopping first if needed.
    pub fn unbind(&mut self) -> Option<Box<dyn FramedSource>> {
        self.shared.stop();
        self.shared.source.borrow_mut().take()
    }
}

impl Drop for MediaSink {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

//! Framed filters: sources whose frames are derived from one upstream
//! source.
//!
//! Filters own their upstream as a boxed [`FramedSource`] and pull into
//! the same destination buffer their caller provided, so frames flow
//! downstream without intermediate allocation. [`HeaderPrefixFilter`]
//! reserves room at the front of the buffer and fills the header in on the
//! way back up; [`FrameAccumulator`] keeps pulling upstream into
//! successive slices of the buffer until it has gathered enough bytes for
//! one delivery.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::env::Environment;

use super::{FrameBuffer, FrameCallback, FrameDelivery, FrameInfo, FramedSource};

// ─────────────────────────────────────────────────────────────────────────────
// HeaderPrefixFilter
// ─────────────────────────────────────────────────────────────────────────────

/// A pull parked because the destination could not hold the header; kept
/// so cancellation can reclaim the buffer before the deferred closure
/// delivery runs.
type ShortfallSlot = Rc<RefCell<Option<(FrameBuffer, FrameCallback)>>>;

/// Prepends a fixed byte header to every upstream frame, zero-copy.
///
/// Presentation time and duration pass through from the upstream frame.
/// A destination too small for the header ends the stream: the shortfall
/// is noted in the environment's result message and the pull completes
/// with closure.
pub struct HeaderPrefixFilter {
    env: Environment,
    upstream: Box<dyn FramedSource>,
    header: Bytes,
    shortfall_pending: ShortfallSlot,
}

impl HeaderPrefixFilter {
    pub fn new(env: &Environment, upstream: Box<dyn FramedSource>, header: Bytes) -> Self {
        Self {
            env: env.clone(),
            upstream,
            header,
            shortfall_pending: Rc::new(RefCell::new(None)),
        }
    }
}

impl FramedSource for HeaderPrefixFilter {
    fn get_next_frame(&mut self, mut buffer: FrameBuffer, completion: FrameCallback) {
        assert!(
            !self.is_currently_awaiting_data(),
            "get_next_frame called while a pull is outstanding"
        );
        let header_len = self.header.len();

        if buffer.max_size() <= header_len && header_len > 0 {
            let shortfall = header_len - buffer.max_size();
            self.env.set_result_msg(format!(
                "destination too small for {header_len}-byte header (short {shortfall} bytes)"
            ));
            *self.shortfall_pending.borrow_mut() = Some((buffer, completion));
            let slot = Rc::downgrade(&self.shortfall_pending);
            self.env
                .scheduler()
                .schedule_delayed_task(Duration::ZERO, move || {
                    let Some(slot) = slot.upgrade() else { return };
                    let parked = slot.borrow_mut().take();
                    if let Some((buffer, completion)) = parked {
                        completion(buffer, FrameDelivery::Closed);
                    }
                });
            return;
        }

        buffer.reserve_front(header_len);
        let header = self.header.clone();
        self.upstream.get_next_frame(
            buffer,
            Box::new(move |mut buffer, delivery| {
                buffer.release_front(header.len());
                match delivery {
                    FrameDelivery::Closed => completion(buffer, FrameDelivery::Closed),
                    FrameDelivery::Frame(mut info) => {
                        buffer.front_mut(header.len()).copy_from_slice(&header);
                        info.frame_size += header.len();
                        completion(buffer, FrameDelivery::Frame(info));
                    }
                }
            }),
        );
    }

    fn stop_getting_frames(&mut self) -> Option<FrameBuffer> {
        if let Some((buffer, _completion)) = self.shortfall_pending.borrow_mut().take() {
            return Some(buffer);
        }
        let header_len = self.header.len();
        self.upstream.stop_getting_frames().map(|mut buffer| {
            buffer.release_front(header_len);
            buffer
        })
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.shortfall_pending.borrow().is_some() || self.upstream.is_currently_awaiting_data()
    }

    fn max_frame_size(&self) -> usize {
        match self.upstream.max_frame_size() {
            0 => 0,
            upstream_max => upstream_max + self.header.len(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FrameAccumulator
// ─────────────────────────────────────────────────────────────────────────────

struct AccumState {
    /// Bytes gathered so far for the current downstream pull.
    gathered: usize,
    /// Portion of `gathered` currently reserved at the buffer front.
    reserved: usize,
    first_presentation: Option<SystemTime>,
    total_duration: Duration,
    truncated_bytes: usize,
    downstream: Option<FrameCallback>,
}

impl AccumState {
    fn idle() -> Self {
        Self {
            gathered: 0,
            reserved: 0,
            first_presentation: None,
            total_duration: Duration::ZERO,
            truncated_bytes: 0,
            downstream: None,
        }
    }
}

struct AccumShared {
    upstream: RefCell<Box<dyn FramedSource>>,
    desired_size: usize,
    state: RefCell<AccumState>,
}

/// Gathers successive upstream frames into one delivery.
///
/// Keeps pulling upstream into the tail of the destination until at least
/// `desired_size` bytes are gathered, the buffer fills, or the upstream
/// closes; then delivers everything gathered as a single frame carrying
/// the first gathered frame's presentation time and the summed durations.
/// After an upstream closure has flushed, the next pull completes with
/// closure.
pub struct FrameAccumulator {
    shared: Rc<AccumShared>,
}

impl FrameAccumulator {
    pub fn new(upstream: Box<dyn FramedSource>, desired_size: usize) -> Self {
        Self {
            shared: Rc::new(AccumShared {
                upstream: RefCell::new(upstream),
                desired_size,
                state: RefCell::new(AccumState::idle()),
            }),
        }
    }

    fn pull_more(shared: Rc<AccumShared>, mut buffer: FrameBuffer) {
        {
            let mut state = shared.state.borrow_mut();
            let delta = state.gathered - state.reserved;
            buffer.reserve_front(delta);
            state.reserved = state.gathered;
        }
        let again = shared.clone();
        shared.upstream.borrow_mut().get_next_frame(
            buffer,
            Box::new(move |mut buffer, delivery| {
                let flush = {
                    let mut state = again.state.borrow_mut();
                    match delivery {
                        FrameDelivery::Closed => true,
                        FrameDelivery::Frame(info) => {
                            state.gathered += info.frame_size;
                            state.truncated_bytes = info.truncated_bytes;
                            if state.first_presentation.is_none() {
                                state.first_presentation = Some(info.presentation_time);
                            }
                            state.total_duration += info.duration;
                            let buffer_full = buffer.max_size() == info.frame_size;
                            state.gathered >= again.desired_size
                                || buffer_full
                                || info.truncated_bytes > 0
                        }
                    }
                };
                if flush {
                    Self::flush(again, buffer);
                } else {
                    Self::pull_more(again, buffer);
                }
            }),
        );
    }

    fn flush(shared: Rc<AccumShared>, mut buffer: FrameBuffer) {
        let (completion, delivery) = {
            let mut state = shared.state.borrow_mut();
            buffer.release_front(state.reserved);
            let completion = state
                .downstream
                .take()
                .expect("accumulator flush without a downstream pull");
            let delivery = if state.gathered == 0 {
                FrameDelivery::Closed
            } else {
                FrameDelivery::Frame(FrameInfo {
                    frame_size: state.gathered,
                    truncated_bytes: state.truncated_bytes,
                    presentation_time: state
                        .first_presentation
                        .unwrap_or_else(SystemTime::now),
                    duration: state.total_duration,
                })
            };
            *state = AccumState::idle();
            (completion, delivery)
        };
        completion(buffer, delivery);
    }
}

impl FramedSource for FrameAccumulator {
    fn get_next_frame(&mut self, buffer: FrameBuffer, completion: FrameCallback) {
        {
            let mut state = self.shared.state.borrow_mut();
            assert!(
                state.downstream.is_none(),
                "get_next_frame called while a pull is outstanding"
            );
            state.downstream = Some(completion);
        }
        Self::pull_more(self.shared.clone(), buffer);
    }

    fn stop_getting_frames(&mut self) -> Option<FrameBuffer> {
        let reclaimed = self.shared.upstream.borrow_mut().stop_getting_frames();
        let mut state = self.shared.state.borrow_mut();
        let reserved = state.reserved;
        *state = AccumState::idle();
        reclaimed.map(|mut buffer| {
            buffer.release_front(reserved);
            buffer
        })
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.shared.state.borrow().downstream.is_some()
    }

    fn max_frame_size(&self) -> usize {
        self.shared.desired_size
    }
}

//! Discrete-frame source fed by the application.
//!
//! Frames pushed into a [`QueuedFrameSource`] come back out one per pull,
//! whole: a frame larger than the destination is truncated (the overflow
//! is reported, then discarded; discrete frames are never split across
//! deliveries). A pull that arrives while the queue is empty parks until
//! the next push or until [`finish`](QueueProducer::finish) marks the end
//! of the stream.
//!
//! The producer half is loop-thread only. To feed frames from another
//! thread, fire an event trigger whose handler does the pushing.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use crate::env::Environment;

use super::{FrameBuffer, FrameCallback, FrameDelivery, FrameInfo, FramedSource};

struct PendingPull {
    buffer: FrameBuffer,
    completion: FrameCallback,
}

/// One queued frame plus its timing.
struct QueuedFrame {
    data: Bytes,
    duration: Duration,
}

struct QueueInner {
    env: Environment,
    frames: VecDeque<QueuedFrame>,
    finished: bool,
    prev_presentation: Option<SystemTime>,
    pending: Option<PendingPull>,
    /// Guards against piling up delivery tasks for one pull.
    delivery_scheduled: bool,
}

impl QueueInner {
    fn schedule_delivery(cell: &Rc<RefCell<QueueInner>>) {
        let mut inner = cell.borrow_mut();
        if inner.delivery_scheduled || inner.pending.is_none() {
            return;
        }
        // Nothing to hand over yet; the next push re-arms delivery.
        if inner.frames.is_empty() && !inner.finished {
            return;
        }
        inner.delivery_scheduled = true;
        let weak = Rc::downgrade(cell);
        inner
            .env
            .scheduler()
            .schedule_delayed_task(Duration::ZERO, move || QueueInner::deliver(weak));
    }

    fn deliver(weak: Weak<RefCell<QueueInner>>) {
        let Some(cell) = weak.upgrade() else {
            return;
        };
        let (pull, delivery) = {
            let mut inner = cell.borrow_mut();
            inner.delivery_scheduled = false;
            let Some(mut pull) = inner.pending.take() else {
                return; // cancelled in the meantime
            };
            match inner.frames.pop_front() {
                None => {
                    if inner.finished {
                        (pull, FrameDelivery::Closed)
                    } else {
                        // Emptied again before delivery ran; keep waiting.
                        inner.pending = Some(pull);
                        return;
                    }
                }
                Some(frame) => {
                    let frame_size = frame.data.len().min(pull.buffer.max_size());
                    let truncated_bytes = frame.data.len() - frame_size;
                    pull.buffer.dest()[..frame_size].copy_from_slice(&frame.data[..frame_size]);

                    let now = SystemTime::now();
                    let presentation_time = match inner.prev_presentation {
                        Some(prev) => now.max(prev),
                        None => now,
                    };
                    inner.prev_presentation = Some(presentation_time);

                    (
                        pull,
                        FrameDelivery::Frame(FrameInfo {
                            frame_size,
                            truncated_bytes,
                            presentation_time,
                            duration: frame.duration,
                        }),
                    )
                }
            }
        };
        (pull.completion)(pull.buffer, delivery);
    }
}

/// Producer half of a [`QueuedFrameSource`]. Loop-thread only.
#[derive(Clone)]
pub struct QueueProducer {
    inner: Rc<RefCell<QueueInner>>,
}

impl QueueProducer {
    /// Queues one discrete frame for delivery.
    pub fn push(&self, data: Bytes) {
        self.push_with_duration(data, Duration::ZERO);
    }

    /// Queues one discrete frame with an explicit play duration.
    pub fn push_with_duration(&self, data: Bytes, duration: Duration) {
        self.inner
            .borrow_mut()
            .frames
            .push_back(QueuedFrame { data, duration });
        QueueInner::schedule_delivery(&self.inner);
    }

    /// Marks the end of the stream: once the queue drains, pulls complete
    /// with closure.
    pub fn finish(&self) {
        self.inner.borrow_mut().finished = true;
        QueueInner::schedule_delivery(&self.inner);
    }

    /// Frames currently waiting for a pull.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.borrow().frames.len()
    }
}

/// Source that replays application-pushed discrete frames.
pub struct QueuedFrameSource {
    inner: Rc<RefCell<QueueInner>>,
}

impl QueuedFrameSource {
    /// Creates the source and its producer handle.
    pub fn new(env: &Environment) -> (Self, QueueProducer) {
        let inner = Rc::new(RefCell::new(QueueInner {
            env: env.clone(),
            frames: VecDeque::new(),
            finished: false,
            prev_presentation: None,
            pending: None,
            delivery_scheduled: false,
        }));
        (
            Self {
                inner: inner.clone(),
            },
            QueueProducer { inner },
        )
    }
}

impl FramedSource for QueuedFrameSource {
    fn get_next_frame(&mut self, buffer: FrameBuffer, completion: FrameCallback) {
        {
            let mut inner = self.inner.borrow_mut();
            assert!(
                inner.pending.is_none(),
                "get_next_frame called while a pull is outstanding"
            );
            inner.pending = Some(PendingPull { buffer, completion });
        }
        QueueInner::schedule_delivery(&self.inner);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::scheduler::TaskScheduler;

    fn test_env() -> Environment {
        Environment::new(TaskScheduler::new().unwrap())
    }

    fn pull_one(
        env: &Environment,
        source: &mut dyn FramedSource,
        capacity: usize,
    ) -> (FrameBuffer, FrameDelivery) {
        let result: Rc<RefCell<Option<(FrameBuffer, FrameDelivery)>>> = Rc::new(RefCell::new(None));
        let slot = result.clone();
        source.get_next_frame(
            FrameBuffer::with_capacity(capacity),
            Box::new(move |buffer, delivery| {
                *slot.borrow_mut() = Some((buffer, delivery));
            }),
        );
        while result.borrow().is_none() {
            env.scheduler()
                .single_step(Some(Duration::from_millis(10)))
                .unwrap();
        }
        Rc::try_unwrap(result).ok().unwrap().into_inner().unwrap()
    }

    #[test]
    fn queued_frames_come_back_in_order() {
        let env = test_env();
        let (mut source, producer) = QueuedFrameSource::new(&env);
        producer.push(Bytes::from_static(b"one"));
        producer.push(Bytes::from_static(b"two"));

        let (buffer, delivery) = pull_one(&env, &mut source, 16);
        let FrameDelivery::Frame(info) = delivery else {
            panic!("expected frame");
        };
        assert_eq!(buffer.frame(info.frame_size), b"one");

        let (buffer, delivery) = pull_one(&env, &mut source, 16);
        let FrameDelivery::Frame(info) = delivery else {
            panic!("expected frame");
        };
        assert_eq!(buffer.frame(info.frame_size), b"two");
    }

    #[test]
    fn oversized_frame_truncates_and_source_stays_pullable() {
        let env = test_env();
        let (mut source, producer) = QueuedFrameSource::new(&env);
        producer.push(Bytes::from(vec![0xAB; 2000]));
        producer.push(Bytes::from_static(b"next"));

        let (buffer, delivery) = pull_one(&env, &mut source, 1024);
        let FrameDelivery::Frame(info) = delivery else {
            panic!("expected frame");
        };
        assert_eq!(info.frame_size, 1024);
        assert_eq!(info.truncated_bytes, 976);
        assert!(buffer.frame(1024).iter().all(|&b| b == 0xAB));

        // The truncated remainder is discarded; the next pull sees the
        // next whole frame.
        let (buffer, delivery) = pull_one(&env, &mut source, 1024);
        let FrameDelivery::Frame(info) = delivery else {
            panic!("expected frame");
        };
        assert_eq!(buffer.frame(info.frame_size), b"next");
    }

    #[test]
    fn pull_parks_until_a_frame_is_pushed() {
        let env = test_env();
        let (mut source, producer) = QueuedFrameSource::new(&env);

        let delivered = Rc::new(Cell::new(false));
        let flag = delivered.clone();
        source.get_next_frame(
            FrameBuffer::with_capacity(16),
            Box::new(move |_, _| flag.set(true)),
        );

        env.scheduler().single_step(Some(Duration::ZERO)).unwrap();
        assert!(!delivered.get());
        assert!(source.is_currently_awaiting_data());

        producer.push(Bytes::from_static(b"late"));
        env.scheduler().single_step(Some(Duration::ZERO)).unwrap();
        assert!(delivered.get());
    }

    #[test]
    fn finish_closes_after_the_queue_drains() {
        let env = test_env();
        let (mut source, producer) = QueuedFrameSource::new(&env);
        producer.push(Bytes::from_static(b"last"));
        producer.finish();

        let (_, delivery) = pull_one(&env, &mut source, 16);
        assert!(matches!(delivery, FrameDelivery::Frame(_)));
        let (_, delivery) = pull_one(&env, &mut source, 16);
        assert!(matches!(delivery, FrameDelivery::Closed));
    }
}

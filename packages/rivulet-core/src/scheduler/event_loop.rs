//! The event loop: fd readiness, triggers, and timed alarms multiplexed on
//! one thread.
//!
//! Step ordering inside [`TaskScheduler::single_step`] is load-bearing and
//! deliberate: socket handlers run first, then at most one trigger, then
//! the due-alarm sweep. A trigger handler that tears infrastructure down
//! therefore always observes a consistent socket-handler set for the step.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::{SchedulerError, SchedulerResult};

use super::backend::{self, BackendKind, PollBackend, Readiness};
use super::delay_queue::{DelayQueue, TaskToken};
use super::handler_set::HandlerSet;
use super::triggers::{EventTriggerId, TriggerHandle, TriggerPayload, TriggerRegistry};
use super::ConditionSet;

/// Kernel timeouts beyond this make `select()` fail on some platforms, so
/// waits are capped at a million seconds (11.5 days).
const MAX_WAIT: Duration = Duration::from_secs(1_000_000);

/// Cooperative single-threaded scheduler.
///
/// Everything except [`TriggerHandle::trigger_event`] (and the watch
/// variable passed to [`do_event_loop`](Self::do_event_loop)) must be
/// called from the thread that runs the loop.
pub struct TaskScheduler {
    backend: RefCell<Box<dyn PollBackend>>,
    handlers: RefCell<HandlerSet>,
    delay_queue: RefCell<DelayQueue>,
    triggers: TriggerRegistry,
    ready_scratch: RefCell<Vec<Readiness>>,
}

impl TaskScheduler {
    /// Creates a scheduler on the platform's preferred readiness backend.
    pub fn new() -> SchedulerResult<Rc<Self>> {
        Self::with_backend(BackendKind::default_for_platform())
    }

    /// Creates a scheduler on a specific readiness backend.
    pub fn with_backend(kind: BackendKind) -> SchedulerResult<Rc<Self>> {
        let backend = backend::create(kind).map_err(SchedulerError::BackendInit)?;
        log::debug!("[Scheduler] created with {} backend", backend.name());
        Ok(Rc::new(Self {
            backend: RefCell::new(backend),
            handlers: RefCell::new(HandlerSet::new()),
            delay_queue: RefCell::new(DelayQueue::new()),
            triggers: TriggerRegistry::new(),
            ready_scratch: RefCell::new(Vec::new()),
        }))
    }

    /// Keeps the loop waking at least every `granularity` via a
    /// self-rescheduling alarm, so pending triggers are observed promptly
    /// even when no fd ever becomes ready before the next natural timeout.
    pub fn set_max_granularity(self: &Rc<Self>, granularity: Duration) {
        fn tick(weak: Weak<TaskScheduler>, granularity: Duration) {
            if let Some(scheduler) = weak.upgrade() {
                let next = Rc::downgrade(&scheduler);
                scheduler.schedule_delayed_task(granularity, move || tick(next, granularity));
            }
        }
        tick(Rc::downgrade(self), granularity);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Delayed tasks
    // ─────────────────────────────────────────────────────────────────────

    /// Schedules `task` to run `delay` from now; the token cancels it.
    pub fn schedule_delayed_task(
        &self,
        delay: Duration,
        task: impl FnOnce() + 'static,
    ) -> TaskToken {
        self.delay_queue.borrow_mut().add(delay, Box::new(task))
    }

    /// Microsecond-delay variant; negative delays are clamped to zero.
    pub fn schedule_delayed_task_us(
        &self,
        delay_us: i64,
        task: impl FnOnce() + 'static,
    ) -> TaskToken {
        let delay = if delay_us < 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(delay_us as u64)
        };
        self.schedule_delayed_task(delay, task)
    }

    /// Cancels the task behind `token` and nulls the caller's handle.
    /// A `None` token, or one whose task already fired, is a silent no-op.
    pub fn unschedule_delayed_task(&self, token: &mut Option<TaskToken>) {
        if let Some(token) = token.take() {
            // Dropping the returned closure releases whatever it captured.
            let _ = self.delay_queue.borrow_mut().remove(token);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Background fd handling
    // ─────────────────────────────────────────────────────────────────────

    /// Installs or replaces the background handler for `fd`. Empty
    /// `conditions` removes any existing handler instead, ignoring
    /// `handler`. Replacement updates the kernel registration as
    /// delete-then-add.
    pub fn set_background_handling(
        &self,
        fd: RawFd,
        conditions: ConditionSet,
        handler: impl FnMut(ConditionSet) + 'static,
    ) -> SchedulerResult<()> {
        if fd < 0 {
            return Ok(());
        }
        if conditions.is_empty() {
            return self.disable_background_handling(fd);
        }

        let replacing = self.handlers.borrow().contains(fd);
        self.handlers
            .borrow_mut()
            .assign(fd, conditions, Box::new(handler));
        let result = {
            let mut backend = self.backend.borrow_mut();
            if replacing {
                backend.update(fd, conditions)
            } else {
                backend.register(fd, conditions)
            }
        };
        log::trace!(
            "[Scheduler] fd {fd} watching {conditions:?} ({} handlers registered)",
            self.handlers.borrow().len()
        );
        result.map_err(|source| SchedulerError::Registration { fd, source })
    }

    /// Removes the background handler for `fd`, if any.
    pub fn disable_background_handling(&self, fd: RawFd) -> SchedulerResult<()> {
        if !self.handlers.borrow_mut().clear(fd) {
            return Ok(());
        }
        self.backend
            .borrow_mut()
            .deregister(fd)
            .map_err(|source| SchedulerError::Registration { fd, source })
    }

    /// Re-keys the handler from `old_fd` to `new_fd` (used when a socket is
    /// duped onto a new fd) without invoking it. Unknown `old_fd` is a
    /// no-op.
    pub fn move_socket_handling(&self, old_fd: RawFd, new_fd: RawFd) -> SchedulerResult<()> {
        if old_fd < 0 || new_fd < 0 {
            return Ok(());
        }
        let Some(conditions) = self.handlers.borrow().conditions(old_fd) else {
            return Ok(());
        };
        self.backend
            .borrow_mut()
            .transfer(old_fd, new_fd, conditions)
            .map_err(|source| SchedulerError::Registration { fd: new_fd, source })?;
        self.handlers.borrow_mut().move_handler(old_fd, new_fd);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Event triggers
    // ─────────────────────────────────────────────────────────────────────

    /// Registers `handler` and returns its single-bit trigger id, or `None`
    /// when all trigger slots are in use.
    pub fn create_event_trigger(
        &self,
        handler: impl FnMut(Option<TriggerPayload>) + 'static,
    ) -> Option<EventTriggerId> {
        self.triggers.create(Box::new(handler))
    }

    /// Unregisters the trigger(s) named in `id`, clearing any pending state.
    pub fn delete_event_trigger(&self, id: EventTriggerId) {
        self.triggers.delete(id);
    }

    /// Fires the trigger(s) named in `id`. Also available from foreign
    /// threads through [`trigger_handle`](Self::trigger_handle).
    pub fn trigger_event(&self, id: EventTriggerId, payload: Option<TriggerPayload>) {
        self.triggers.handle().trigger_event(id, payload);
    }

    /// A `Send + Sync` handle other threads (or signal handlers) can use to
    /// fire triggers, the only scheduler entry point that crosses threads.
    pub fn trigger_handle(&self) -> TriggerHandle {
        self.triggers.handle()
    }

    // ─────────────────────────────────────────────────────────────────────
    // The loop
    // ─────────────────────────────────────────────────────────────────────

    /// Runs the loop until `watch` (if provided) becomes nonzero.
    pub fn do_event_loop(&self, watch: Option<&AtomicU32>) -> SchedulerResult<()> {
        loop {
            if let Some(watch) = watch {
                if watch.load(Ordering::Acquire) != 0 {
                    return Ok(());
                }
            }
            self.single_step(None)?;
        }
    }

    /// One loop iteration: wait for readiness up to the earlier of the next
    /// alarm and `max_delay`, dispatch ready fd handlers, handle at most
    /// one pending trigger, then fire every due alarm.
    pub fn single_step(&self, max_delay: Option<Duration>) -> SchedulerResult<()> {
        // 1. Deadline: next alarm, capped by the caller and by MAX_WAIT.
        let mut wait = {
            let queue = self.delay_queue.borrow();
            let now_us = queue.now_us();
            queue.time_to_next_alarm(now_us).unwrap_or(MAX_WAIT)
        };
        if let Some(cap) = max_delay {
            wait = wait.min(cap);
        }
        wait = wait.min(MAX_WAIT);

        // 2. The loop's only suspension point.
        let mut ready = std::mem::take(&mut *self.ready_scratch.borrow_mut());
        ready.clear();
        self.backend
            .borrow_mut()
            .wait(wait, &mut ready)
            .map_err(SchedulerError::Backend)?;

        // 3. Dispatch fd handlers with the intersection of reported and
        // watched conditions. The handler is re-looked-up per fd so a
        // callback that mutates the handler set mid-step stays safe;
        // readiness on an fd nobody watches anymore is ignored.
        for report in &ready {
            let Some((watched, callback)) = self.handlers.borrow().callback(report.fd) else {
                continue;
            };
            let fired = report.conditions & watched;
            if !fired.is_empty() {
                (*callback.borrow_mut())(fired);
            }
        }
        ready.clear();
        *self.ready_scratch.borrow_mut() = ready;

        // 4. Triggers run after socket handlers so a trigger that shuts
        // things down sees the step's final socket-handler state.
        self.triggers.handle_one();

        // 5. Fire every alarm that is due, re-reading the clock so alarms
        // coming due during earlier callbacks join the same sweep.
        loop {
            let due = {
                let mut queue = self.delay_queue.borrow_mut();
                let now_us = queue.now_us();
                queue.pop_due(now_us)
            };
            match due {
                Some(callback) => callback(),
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::time::Instant;

    use crate::scheduler::backend::tests::udp_pair;

    fn scheduler() -> Rc<TaskScheduler> {
        TaskScheduler::new().expect("backend should initialize")
    }

    #[test]
    fn delayed_task_fires_once_and_stops_the_loop() {
        let scheduler = scheduler();
        let fired = Rc::new(Cell::new(0u32));
        let watch = Arc::new(AtomicU32::new(0));

        let fired2 = fired.clone();
        let watch2 = watch.clone();
        let started = Instant::now();
        scheduler.schedule_delayed_task(Duration::from_millis(100), move || {
            fired2.set(fired2.get() + 1);
            watch2.store(1, Ordering::Release);
        });

        scheduler.do_event_loop(Some(&watch)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn cancelled_task_never_fires() {
        let scheduler = scheduler();
        let log: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(Vec::new()));
        let watch = Arc::new(AtomicU32::new(0));

        let log_a = log.clone();
        let mut token_a = Some(
            scheduler.schedule_delayed_task(Duration::from_millis(50), move || {
                log_a.borrow_mut().push("a");
            }),
        );
        let log_b = log.clone();
        let watch2 = watch.clone();
        scheduler.schedule_delayed_task(Duration::from_millis(60), move || {
            log_b.borrow_mut().push("b");
            watch2.store(1, Ordering::Release);
        });

        std::thread::sleep(Duration::from_millis(10));
        scheduler.unschedule_delayed_task(&mut token_a);
        assert!(token_a.is_none());

        scheduler.do_event_loop(Some(&watch)).unwrap();
        assert_eq!(*log.borrow(), vec!["b"]);
    }

    #[test]
    fn negative_microsecond_delay_clamps_to_immediate() {
        let scheduler = scheduler();
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        scheduler.schedule_delayed_task_us(-250, move || fired2.set(true));
        scheduler.single_step(Some(Duration::ZERO)).unwrap();
        assert!(fired.get());
    }

    #[test]
    fn unschedule_after_firing_is_a_no_op() {
        let scheduler = scheduler();
        let mut token = Some(scheduler.schedule_delayed_task(Duration::ZERO, || {}));
        scheduler.single_step(Some(Duration::ZERO)).unwrap();
        scheduler.unschedule_delayed_task(&mut token);
        assert!(token.is_none());
    }

    #[test]
    fn step_dispatches_fd_then_trigger_then_timer() {
        let scheduler = scheduler();
        let order: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(Vec::new()));

        // A datagram already waiting makes the fd readable up front.
        let (sender, receiver, fd) = udp_pair();
        sender.send(b"ping").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let order_fd = order.clone();
        scheduler
            .set_background_handling(fd, ConditionSet::READABLE, move |_| {
                order_fd.borrow_mut().push("fd");
            })
            .unwrap();

        let order_trigger = order.clone();
        let trigger = scheduler
            .create_event_trigger(move |_| order_trigger.borrow_mut().push("trigger"))
            .unwrap();
        scheduler.trigger_event(trigger, None);

        let order_timer = order.clone();
        scheduler.schedule_delayed_task(Duration::ZERO, move || {
            order_timer.borrow_mut().push("timer");
        });

        scheduler.single_step(Some(Duration::ZERO)).unwrap();
        assert_eq!(*order.borrow(), vec!["fd", "trigger", "timer"]);
        drop(receiver);
    }

    #[test]
    fn cross_thread_trigger_hammer() {
        let scheduler = scheduler();
        let observed: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = observed.clone();
        let trigger = scheduler
            .create_event_trigger(move |payload| {
                if let Some(value) = payload.and_then(|p| p.downcast::<u32>().ok()) {
                    sink.borrow_mut().push(*value);
                }
            })
            .unwrap();

        let handle = scheduler.trigger_handle();
        let producer = std::thread::spawn(move || {
            for value in 1..=1_000u32 {
                let payload: TriggerPayload = Arc::new(value);
                handle.trigger_event(trigger, Some(payload));
            }
        });

        // Keep stepping while the producer runs, then drain what remains.
        while !producer.is_finished() {
            scheduler.single_step(Some(Duration::from_millis(1))).unwrap();
        }
        producer.join().unwrap();
        scheduler.single_step(Some(Duration::ZERO)).unwrap();

        let observed = observed.borrow();
        assert!(!observed.is_empty());
        assert!(observed.len() <= 1_000);
        assert!(observed.iter().all(|v| (1..=1_000).contains(v)));
        assert_eq!(*observed.last().unwrap(), 1_000);
    }

    #[test]
    fn readable_fd_fires_until_drained() {
        let scheduler = scheduler();
        let (sender, receiver, fd) = udp_pair();
        sender.send(b"ping").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let hits = Rc::new(Cell::new(0u32));
        let hits2 = hits.clone();
        scheduler
            .set_background_handling(fd, ConditionSet::READABLE, move |_| {
                hits2.set(hits2.get() + 1);
                // Deliberately do not read: level-triggered readiness must
                // report again on the next step.
            })
            .unwrap();

        scheduler.single_step(Some(Duration::from_millis(100))).unwrap();
        scheduler.single_step(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(hits.get(), 2);

        // Now drain and confirm silence.
        let mut buf = [0u8; 16];
        receiver.recv(&mut buf).unwrap();
        scheduler.single_step(Some(Duration::from_millis(30))).unwrap();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn disable_background_handling_stops_dispatch() {
        let scheduler = scheduler();
        let (sender, receiver, fd) = udp_pair();

        let hits = Rc::new(Cell::new(0u32));
        let hits2 = hits.clone();
        scheduler
            .set_background_handling(fd, ConditionSet::READABLE, move |_| {
                hits2.set(hits2.get() + 1);
            })
            .unwrap();
        scheduler.disable_background_handling(fd).unwrap();

        sender.send(b"ping").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        scheduler.single_step(Some(Duration::from_millis(30))).unwrap();
        assert_eq!(hits.get(), 0);
        drop(receiver);
    }

    #[test]
    fn handler_replacement_takes_effect() {
        let scheduler = scheduler();
        let (sender, receiver, fd) = udp_pair();

        let first = Rc::new(Cell::new(0u32));
        let second = Rc::new(Cell::new(0u32));
        let first2 = first.clone();
        scheduler
            .set_background_handling(fd, ConditionSet::READABLE, move |_| {
                first2.set(first2.get() + 1);
            })
            .unwrap();
        let second2 = second.clone();
        scheduler
            .set_background_handling(fd, ConditionSet::READABLE, move |_| {
                second2.set(second2.get() + 1);
            })
            .unwrap();

        sender.send(b"ping").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        scheduler.single_step(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(first.get(), 0);
        assert_eq!(second.get(), 1);
        drop(receiver);
    }

    #[test]
    fn move_socket_handling_follows_a_duped_fd() {
        let scheduler = scheduler();
        let (sender, receiver, fd) = udp_pair();

        let hits = Rc::new(Cell::new(0u32));
        let hits2 = hits.clone();
        scheduler
            .set_background_handling(fd, ConditionSet::READABLE, move |_| {
                hits2.set(hits2.get() + 1);
            })
            .unwrap();

        let duped = unsafe { libc::dup(fd) };
        assert!(duped >= 0);
        scheduler.move_socket_handling(fd, duped).unwrap();

        sender.send(b"ping").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        scheduler.single_step(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(hits.get(), 1);

        unsafe {
            libc::close(duped);
        }
        drop(receiver);
    }

    #[test]
    fn registration_failure_surfaces_as_an_error() {
        let scheduler = TaskScheduler::with_backend(BackendKind::Select).unwrap();
        let out_of_range = libc::FD_SETSIZE as RawFd;
        let err = scheduler
            .set_background_handling(out_of_range, ConditionSet::READABLE, |_| {})
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Registration { .. }));
    }

    #[test]
    fn granularity_tick_keeps_the_loop_turning() {
        let scheduler = scheduler();
        scheduler.set_max_granularity(Duration::from_millis(5));

        // With no fds and no other alarms, steps still come back quickly
        // because the tick alarm bounds the wait.
        let started = Instant::now();
        for _ in 0..3 {
            scheduler.single_step(None).unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn select_backend_runs_the_same_loop() {
        let scheduler = TaskScheduler::with_backend(BackendKind::Select).unwrap();
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        scheduler.schedule_delayed_task(Duration::ZERO, move || fired2.set(true));
        scheduler.single_step(Some(Duration::ZERO)).unwrap();
        assert!(fired.get());
    }
}

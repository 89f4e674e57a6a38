//! Cross-thread event triggers.
//!
//! A trigger is a pre-registered signal into the event loop, identified by
//! a single-bit mask. Firing one is the only scheduler operation that is
//! safe from foreign threads (and signal handlers): it stores a payload and
//! sets a bit in one atomic pending word. The loop thread consumes pending
//! bits between I/O dispatch and the timer sweep, handling at most one
//! trigger per step and scanning round-robin so no slot starves.
//!
//! Payload slots deliberately have last-write-wins semantics: a second
//! `trigger_event` before the first is handled overwrites the payload while
//! the handler still fires only once. Callers that need every payload must
//! use separate triggers or serialize externally.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::BitOr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Maximum number of concurrently registered event triggers.
pub const MAX_EVENT_TRIGGERS: usize = 32;

/// Slot 0 owns the high bit; slot `i` owns `HIGH_BIT >> i`.
const HIGH_BIT: u32 = 0x8000_0000;

/// Payload attached to a trigger firing. `Arc` so a multi-bit id can hand
/// the same payload to every named slot.
pub type TriggerPayload = Arc<dyn Any + Send + Sync>;

/// Handler run on the loop thread when a trigger is consumed.
pub type TriggerHandlerFn = Box<dyn FnMut(Option<TriggerPayload>)>;

/// Identifier of one registered trigger: a mask with a single bit set.
///
/// Ids may be OR-combined for `trigger_event` / `delete_event_trigger`,
/// which treat every set bit as a separate trigger.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTriggerId(u32);

impl EventTriggerId {
    /// The raw bit mask.
    #[must_use]
    pub fn mask(self) -> u32 {
        self.0
    }
}

impl BitOr for EventTriggerId {
    type Output = EventTriggerId;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for EventTriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventTriggerId({:#010x})", self.0)
    }
}

fn mask_for_slot(slot: usize) -> u32 {
    HIGH_BIT >> slot
}

/// State shared with foreign threads: the pending word and payload slots.
struct TriggerShared {
    /// Bit set = trigger awaiting handling. Set with `fetch_or`/Release by
    /// `trigger_event`, consumed with `fetch_and`/AcqRel on the loop thread.
    pending: AtomicU32,
    payloads: [Mutex<Option<TriggerPayload>>; MAX_EVENT_TRIGGERS],
}

/// Thread-safe entry point for firing triggers.
///
/// Cheap to clone; valid for the scheduler's lifetime. Firing a deleted or
/// never-registered trigger is harmless (the bit is cleared unconsumed).
#[derive(Clone)]
pub struct TriggerHandle {
    shared: Arc<TriggerShared>,
}

impl TriggerHandle {
    /// Records `payload` and marks every trigger named in `id` as pending.
    ///
    /// Callable from any thread or signal handler. The payload is stored
    /// before the pending bit is published.
    pub fn trigger_event(&self, id: EventTriggerId, payload: Option<TriggerPayload>) {
        if id.mask() == 0 {
            return;
        }
        for slot in 0..MAX_EVENT_TRIGGERS {
            if id.mask() & mask_for_slot(slot) != 0 {
                *self.shared.payloads[slot].lock() = payload.clone();
            }
        }
        self.shared.pending.fetch_or(id.mask(), Ordering::Release);
    }
}

/// Shared, re-entrant handle to a trigger handler, cloned out of the table
/// before invocation so the handler may delete or re-create triggers.
type HandlerSlot = Option<Rc<RefCell<TriggerHandlerFn>>>;

/// Loop-thread side of the trigger table.
pub(crate) struct TriggerRegistry {
    shared: Arc<TriggerShared>,
    handlers: RefCell<[HandlerSlot; MAX_EVENT_TRIGGERS]>,
    last_used_slot: Cell<usize>,
    last_used_mask: Cell<u32>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TriggerShared {
                pending: AtomicU32::new(0),
                payloads: std::array::from_fn(|_| Mutex::new(None)),
            }),
            handlers: RefCell::new(std::array::from_fn(|_| None)),
            // Primed so the first allocation lands on slot 0 / the high bit.
            last_used_slot: Cell::new(MAX_EVENT_TRIGGERS - 1),
            last_used_mask: Cell::new(mask_for_slot(MAX_EVENT_TRIGGERS - 1)),
        }
    }

    pub fn handle(&self) -> TriggerHandle {
        TriggerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Allocates a free slot for `handler` and returns its single-bit id,
    /// or `None` when all slots are taken. Allocation resumes one past the
    /// last-used slot so repeated create/delete cycles do not starve slots.
    pub fn create(&self, handler: TriggerHandlerFn) -> Option<EventTriggerId> {
        let mut handlers = self.handlers.borrow_mut();
        let start = self.last_used_slot.get();
        let mut slot = start;
        let mut mask = self.last_used_mask.get();
        loop {
            slot = (slot + 1) % MAX_EVENT_TRIGGERS;
            mask >>= 1;
            if mask == 0 {
                mask = HIGH_BIT;
            }
            if handlers[slot].is_none() {
                handlers[slot] = Some(Rc::new(RefCell::new(handler)));
                *self.shared.payloads[slot].lock() = None;
                self.last_used_slot.set(slot);
                self.last_used_mask.set(mask);
                return Some(EventTriggerId(mask));
            }
            if slot == start {
                return None;
            }
        }
    }

    /// Clears every trigger named in `id`: handler gone, payload dropped,
    /// pending bit cleared. Multi-bit ids are accepted and each set bit is
    /// cleared.
    pub fn delete(&self, id: EventTriggerId) {
        self.shared.pending.fetch_and(!id.mask(), Ordering::AcqRel);
        let mut handlers = self.handlers.borrow_mut();
        for slot in 0..MAX_EVENT_TRIGGERS {
            if id.mask() & mask_for_slot(slot) != 0 {
                handlers[slot] = None;
                *self.shared.payloads[slot].lock() = None;
            }
        }
    }

    /// Consumes and handles at most one pending trigger. Returns whether a
    /// handler ran.
    ///
    /// The scan starts one past the last-handled slot for round-robin
    /// fairness, with a fast path when the pending word names exactly the
    /// last-used trigger.
    pub fn handle_one(&self) -> bool {
        let pending = self.shared.pending.load(Ordering::Acquire);
        if pending == 0 {
            return false;
        }
        if pending == self.last_used_mask.get() {
            return self.fire(self.last_used_slot.get(), pending);
        }
        let start = self.last_used_slot.get();
        let mut slot = start;
        let mut mask = self.last_used_mask.get();
        loop {
            slot = (slot + 1) % MAX_EVENT_TRIGGERS;
            mask >>= 1;
            if mask == 0 {
                mask = HIGH_BIT;
            }
            if pending & mask != 0 {
                self.last_used_slot.set(slot);
                self.last_used_mask.set(mask);
                return self.fire(slot, mask);
            }
            if slot == start {
                return false;
            }
        }
    }

    fn fire(&self, slot: usize, mask: u32) -> bool {
        self.shared.pending.fetch_and(!mask, Ordering::AcqRel);
        let payload = self.shared.payloads[slot].lock().take();
        let handler = self.handlers.borrow()[slot].clone();
        match handler {
            Some(handler) => {
                (*handler.borrow_mut())(payload);
                true
            }
            None => false,
        }
    }
}

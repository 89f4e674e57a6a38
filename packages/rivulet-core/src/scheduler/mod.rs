//! Single-threaded cooperative task scheduler.
//!
//! One thread drives everything: fd readiness dispatch, cross-thread
//! triggers, and timed alarms, in that order within each loop step. The
//! only blocking point is the kernel readiness wait. Callbacks must be
//! short and schedule continuations instead of looping internally; a
//! long-running callback starves the whole loop.

pub mod backend;
pub mod delay_queue;
pub mod event_loop;
pub(crate) mod handler_set;
pub mod triggers;

pub use backend::BackendKind;
pub use delay_queue::TaskToken;
pub use event_loop::TaskScheduler;
pub use triggers::{
    EventTriggerId, TriggerHandle, TriggerPayload, MAX_EVENT_TRIGGERS,
};

bitflags::bitflags! {
    /// I/O readiness conditions a background handler can watch for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConditionSet: u32 {
        /// The fd has data (or a peer closure) to read.
        const READABLE = 0x1;
        /// The fd can accept writes without blocking.
        const WRITABLE = 0x2;
        /// The fd has an exceptional condition pending.
        const EXCEPTION = 0x4;
    }
}

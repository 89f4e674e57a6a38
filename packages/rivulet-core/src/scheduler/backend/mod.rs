//! Pluggable kernel readiness backends.
//!
//! The event loop blocks in exactly one place: the backend's `wait`. Two
//! backends are provided, both level-triggered:
//!
//! - [`select`]: portable across Unix platforms; reports every ready fd.
//! - [`epoll`] (Linux): scales past `FD_SETSIZE`; reports at most one
//!   ready fd per wait, spreading dispatch across loop iterations.
//!
//! `EINTR` during a wait is reported as an empty result, never an error.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use super::ConditionSet;

#[cfg(target_os = "linux")]
pub(crate) mod epoll;
pub(crate) mod select;

/// One readiness report from the kernel: which fd, which conditions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub fd: RawFd,
    pub conditions: ConditionSet,
}

/// A kernel readiness multiplexor the event loop can block on.
pub(crate) trait PollBackend {
    /// Human-readable backend name for logs.
    fn name(&self) -> &'static str;

    /// Starts watching `fd` for `conditions`.
    fn register(&mut self, fd: RawFd, conditions: ConditionSet) -> io::Result<()>;

    /// Replaces the watched conditions for an already-registered `fd`.
    /// Implemented as delete-then-add so the kernel registration changes
    /// atomically with respect to this loop.
    fn update(&mut self, fd: RawFd, conditions: ConditionSet) -> io::Result<()>;

    /// Stops watching `fd`.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Moves a registration from `old_fd` to `new_fd`, keeping `conditions`.
    fn transfer(&mut self, old_fd: RawFd, new_fd: RawFd, conditions: ConditionSet) -> io::Result<()>;

    /// Blocks up to `timeout` for readiness and appends reports to `out`.
    fn wait(&mut self, timeout: Duration, out: &mut Vec<Readiness>) -> io::Result<()>;
}

/// Which backend a scheduler should multiplex with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// `select(2)`: portable, fds below `FD_SETSIZE` only.
    Select,
    /// `epoll(7)`: Linux only.
    #[cfg(target_os = "linux")]
    Epoll,
}

impl BackendKind {
    /// The preferred backend for the current platform.
    #[must_use]
    pub fn default_for_platform() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Epoll
        }
        #[cfg(not(target_os = "linux"))]
        {
            Self::Select
        }
    }
}

pub(crate) fn create(kind: BackendKind) -> io::Result<Box<dyn PollBackend>> {
    match kind {
        BackendKind::Select => Ok(Box::new(select::SelectBackend::new())),
        #[cfg(target_os = "linux")]
        BackendKind::Epoll => Ok(Box::new(epoll::EpollBackend::new()?)),
    }
}

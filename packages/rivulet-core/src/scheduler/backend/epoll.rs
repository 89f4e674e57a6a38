//! Level-triggered `epoll(7)` backend.
//!
//! The kernel cookie carried in `epoll_data` is the fd itself; the event
//! loop resolves it through its handler map. At most one event is drained
//! per wait, so a hot fd cannot monopolize a loop iteration.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::scheduler::ConditionSet;

use super::{PollBackend, Readiness};

/// Converts a wait deadline to whole milliseconds for the kernel, flooring
/// sub-millisecond remainders so a nearly-due alarm polls rather than
/// oversleeps.
fn timeout_millis(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

pub(crate) struct EpollBackend {
    epfd: RawFd,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    fn interest_events(conditions: ConditionSet) -> u32 {
        let mut events = 0;
        if conditions.contains(ConditionSet::READABLE) {
            events |= libc::EPOLLIN as u32;
        }
        if conditions.contains(ConditionSet::WRITABLE) {
            events |= libc::EPOLLOUT as u32;
        }
        // EPOLLERR is always reported; EXCEPTION interest needs no flag.
        events
    }

    fn reported_conditions(events: u32) -> ConditionSet {
        let mut conditions = ConditionSet::empty();
        if events & libc::EPOLLIN as u32 != 0 {
            conditions |= ConditionSet::READABLE;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            conditions |= ConditionSet::WRITABLE;
        }
        if events & libc::EPOLLERR as u32 != 0 {
            conditions |= ConditionSet::EXCEPTION;
        }
        conditions
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// `EPOLL_CTL_DEL` tolerating an fd the kernel no longer knows about
    /// (closed fds fall out of the interest set on their own).
    fn remove_quietly(&self, fd: RawFd) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            Err(err) if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) => Err(err),
            _ => Ok(()),
        }
    }
}

impl PollBackend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn register(&mut self, fd: RawFd, conditions: ConditionSet) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Self::interest_events(conditions))
    }

    fn update(&mut self, fd: RawFd, conditions: ConditionSet) -> io::Result<()> {
        self.remove_quietly(fd)?;
        self.register(fd, conditions)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.remove_quietly(fd)
    }

    fn transfer(&mut self, old_fd: RawFd, new_fd: RawFd, conditions: ConditionSet) -> io::Result<()> {
        self.remove_quietly(old_fd)?;
        self.register(new_fd, conditions)
    }

    fn wait(&mut self, timeout: Duration, out: &mut Vec<Readiness>) -> io::Result<()> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_wait(self.epfd, &mut event, 1, timeout_millis(timeout)) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err);
        }
        if rc > 0 {
            out.push(Readiness {
                fd: event.u64 as RawFd,
                conditions: Self::reported_conditions(event.events),
            });
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::backend::tests::{udp_pair, wait_for};

    #[test]
    fn reports_readable_after_datagram_arrives() {
        let (sender, receiver, receiver_fd) = udp_pair();
        let mut backend = EpollBackend::new().unwrap();
        backend.register(receiver_fd, ConditionSet::READABLE).unwrap();

        sender.send(b"ping").unwrap();
        let ready = wait_for(&mut backend, receiver_fd, Duration::from_secs(2));
        assert!(ready.contains(ConditionSet::READABLE));
        drop(receiver);
    }

    #[test]
    fn reports_writable_immediately() {
        let (_sender, receiver, receiver_fd) = udp_pair();
        let mut backend = EpollBackend::new().unwrap();
        backend.register(receiver_fd, ConditionSet::WRITABLE).unwrap();

        let ready = wait_for(&mut backend, receiver_fd, Duration::from_secs(2));
        assert!(ready.contains(ConditionSet::WRITABLE));
        drop(receiver);
    }

    #[test]
    fn deregistered_fd_stops_reporting() {
        let (sender, receiver, receiver_fd) = udp_pair();
        let mut backend = EpollBackend::new().unwrap();
        backend.register(receiver_fd, ConditionSet::READABLE).unwrap();
        backend.deregister(receiver_fd).unwrap();

        sender.send(b"ping").unwrap();
        let mut out = Vec::new();
        backend.wait(Duration::from_millis(50), &mut out).unwrap();
        assert!(out.is_empty());
        drop(receiver);
    }

    #[test]
    fn returns_at_most_one_event_per_wait() {
        let (sender_a, receiver_a, fd_a) = udp_pair();
        let (sender_b, receiver_b, fd_b) = udp_pair();
        let mut backend = EpollBackend::new().unwrap();
        backend.register(fd_a, ConditionSet::READABLE).unwrap();
        backend.register(fd_b, ConditionSet::READABLE).unwrap();

        sender_a.send(b"a").unwrap();
        sender_b.send(b"b").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut out = Vec::new();
        backend.wait(Duration::from_secs(2), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        drop((receiver_a, receiver_b));
    }
}

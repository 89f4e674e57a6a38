//! Portable `select(2)` backend.
//!
//! Keeps its own fd → interest map (select has no kernel-side registration)
//! and rebuilds the fd sets on every wait. Reports every ready fd, unlike
//! the epoll backend's one-per-wait pacing. Limited to fds below
//! `FD_SETSIZE`.

use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::scheduler::ConditionSet;

use super::{PollBackend, Readiness};

pub(crate) struct SelectBackend {
    interests: HashMap<RawFd, ConditionSet>,
}

impl SelectBackend {
    pub fn new() -> Self {
        Self {
            interests: HashMap::new(),
        }
    }

    fn check_fd(fd: RawFd) -> io::Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("fd {fd} is outside the select() range"),
            ));
        }
        Ok(())
    }
}

impl PollBackend for SelectBackend {
    fn name(&self) -> &'static str {
        "select"
    }

    fn register(&mut self, fd: RawFd, conditions: ConditionSet) -> io::Result<()> {
        Self::check_fd(fd)?;
        self.interests.insert(fd, conditions);
        Ok(())
    }

    fn update(&mut self, fd: RawFd, conditions: ConditionSet) -> io::Result<()> {
        self.register(fd, conditions)
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests.remove(&fd);
        Ok(())
    }

    fn transfer(&mut self, old_fd: RawFd, new_fd: RawFd, conditions: ConditionSet) -> io::Result<()> {
        Self::check_fd(new_fd)?;
        self.interests.remove(&old_fd);
        self.interests.insert(new_fd, conditions);
        Ok(())
    }

    fn wait(&mut self, timeout: Duration, out: &mut Vec<Readiness>) -> io::Result<()> {
        let mut read_set = unsafe {
            let mut set = MaybeUninit::<libc::fd_set>::uninit();
            libc::FD_ZERO(set.as_mut_ptr());
            set.assume_init()
        };
        let mut write_set = read_set;
        let mut except_set = read_set;

        let mut max_fd: RawFd = -1;
        for (&fd, &conditions) in &self.interests {
            unsafe {
                if conditions.contains(ConditionSet::READABLE) {
                    libc::FD_SET(fd, &mut read_set);
                }
                if conditions.contains(ConditionSet::WRITABLE) {
                    libc::FD_SET(fd, &mut write_set);
                }
                if conditions.contains(ConditionSet::EXCEPTION) {
                    libc::FD_SET(fd, &mut except_set);
                }
            }
            max_fd = max_fd.max(fd);
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                &mut except_set,
                &mut tv,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(());
        }

        for (&fd, &interest) in &self.interests {
            let mut conditions = ConditionSet::empty();
            unsafe {
                if interest.contains(ConditionSet::READABLE) && libc::FD_ISSET(fd, &read_set) {
                    conditions |= ConditionSet::READABLE;
                }
                if interest.contains(ConditionSet::WRITABLE) && libc::FD_ISSET(fd, &write_set) {
                    conditions |= ConditionSet::WRITABLE;
                }
                if interest.contains(ConditionSet::EXCEPTION) && libc::FD_ISSET(fd, &except_set) {
                    conditions |= ConditionSet::EXCEPTION;
                }
            }
            if !conditions.is_empty() {
                out.push(Readiness { fd, conditions });
            }
        }
        Ok(())
    }
}

//! The I/O reactor: a thin wrapper over Linux `epoll` that maps kernel
//! readiness events back to `(fd, events)` pairs for the scheduler.

use std::io;
use std::os::unix::io::RawFd;

use log::{trace, warn};

use crate::error::SchedulerError;

/// Interest/readiness bit for read-readiness (`EPOLLIN`).
pub const READABLE: u32 = libc::EPOLLIN as u32;
/// Interest/readiness bit for write-readiness (`EPOLLOUT`).
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;

/// Hard cap on events returned by one `poll` call, matching the spec's
/// `epoll_wait` event-count ceiling.
pub const MAX_EVENTS: usize = 1 << 20;

/// The reactor's own working buffer is much smaller than `MAX_EVENTS`;
/// a scheduler turn that overflows it simply drains the rest on the next
/// poll.
const EVENT_BUF_CAP: usize = 1024;

pub struct Reactor {
    epoll_fd: RawFd,
    buf: Vec<libc::epoll_event>,
}

impl Reactor {
    pub fn new() -> Result<Reactor, SchedulerError> {
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(SchedulerError::ReactorInit(io::Error::last_os_error()));
        }
        Ok(Reactor {
            epoll_fd,
            buf: vec![unsafe { std::mem::zeroed() }; EVENT_BUF_CAP],
        })
    }

    /// Register `fd` for `events`.
    pub fn add(&self, fd: RawFd, events: u32) {
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        assert!(ret == 0, "epoll_ctl(ADD, {fd}) failed: {}", io::Error::last_os_error());
        trace!("reactor: added fd {fd} for events {events:#x}");
    }

    /// Change the interest set already registered for `fd`.
    pub fn modify(&self, fd: RawFd, events: u32) {
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        assert!(ret == 0, "epoll_ctl(MOD, {fd}) failed: {}", io::Error::last_os_error());
    }

    /// Deregister `fd`.
    pub fn remove(&self, fd: RawFd, events: u32) {
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        assert!(ret == 0, "epoll_ctl(DEL, {fd}) failed: {}", io::Error::last_os_error());
        trace!("reactor: removed fd {fd}");
    }

    /// Block up to `timeout_us` microseconds for readiness events.
    /// `timeout_us == 0` means "do not poll" and returns immediately with
    /// no events, matching the source's `if (!usec) return;` shortcut.
    pub fn poll(&mut self, timeout_us: u64) -> Vec<(RawFd, u32)> {
        if timeout_us == 0 {
            return Vec::new();
        }

        let timeout_ms = (timeout_us / 1000).min(i32::MAX as u64) as i32;
        let n = loop {
            let ret = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    self.buf.as_mut_ptr(),
                    self.buf.len() as i32,
                    timeout_ms,
                )
            };
            if ret >= 0 {
                break ret as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                warn!("reactor: epoll_wait interrupted, retrying");
                continue;
            }
            panic!("epoll_wait failed: {err}");
        };

        self.buf[..n].iter().map(|ev| (ev.u64 as RawFd, ev.events)).collect()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

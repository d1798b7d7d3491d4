//! Coroutine-callable wrappers around raw non-blocking socket syscalls.
//!
//! Each helper suspends first, on the assumption that the fd is not yet
//! ready, then attempts the syscall and retries on the errno set that
//! calls for it. Mirrors `co_socket`/`co_accept`/`co_connect`/`co_send`/
//! `co_recv` in the original source, one for one.

use std::os::raw::c_void;
use std::os::unix::io::RawFd;

use log::debug;

use crate::reactor::{READABLE, WRITABLE};
use crate::scheduler::wait_fd;

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn is_retryable(err: i32, set: &[i32]) -> bool {
    set.contains(&err)
}

/// A non-blocking fd with `SO_REUSEADDR` set, or `-1` on failure.
pub fn socket(domain: i32, ty: i32, protocol: i32) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK, protocol) };
    if fd < 0 {
        return -1;
    }
    let reuse: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const _ as *const c_void,
            std::mem::size_of_val(&reuse) as libc::socklen_t,
        );
    }
    fd
}

/// Accept a connection on `fd`, suspending until one is ready. Returns
/// the new (non-blocking) connection fd, or `-1` on a terminal error.
pub fn accept(fd: RawFd) -> RawFd {
    loop {
        wait_fd(fd, READABLE, 0);
        let sockfd = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if sockfd > 0 {
            let ret = unsafe { libc::fcntl(sockfd, libc::F_SETFL, libc::O_NONBLOCK) };
            if ret < 0 {
                unsafe { libc::close(sockfd) };
                return -1;
            }
            return sockfd;
        }
        if errno() != libc::EAGAIN {
            return -1;
        }
        debug!("accept on fd {fd} would block, retrying");
    }
}

/// Connect `fd` to `addr`, suspending on write-readiness between
/// attempts. Returns `0` on success, `-1` on a terminal error.
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    loop {
        wait_fd(fd, WRITABLE, 0);
        let ret = unsafe { libc::connect(fd, addr, addrlen) };
        if ret < 0 && is_retryable(errno(), &[libc::EAGAIN, libc::EWOULDBLOCK, libc::EINPROGRESS]) {
            debug!("connect on fd {fd} would block, retrying");
            continue;
        }
        return if ret < 0 { -1 } else { 0 };
    }
}

/// Send all of `buf` on `fd`, suspending on write-readiness between
/// attempts. Any non-retryable `<= 0` result from `send` is treated as
/// terminal and surfaced as `-1`, rather than looping forever.
pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> isize {
    let mut n = 0usize;
    while n < buf.len() {
        wait_fd(fd, WRITABLE, 0);
        let ret = unsafe {
            libc::send(fd, buf[n..].as_ptr() as *const c_void, buf.len() - n, flags)
        };
        if ret <= 0 {
            let e = errno();
            if is_retryable(e, &[libc::EAGAIN, libc::EWOULDBLOCK, libc::EINTR]) {
                debug!("send on fd {fd} would block, retrying");
                continue;
            }
            return -1;
        }
        n += ret as usize;
    }
    n as isize
}

/// Receive into `buf` from `fd`, suspending on read-readiness. Returns
/// the byte count (`0` means the peer closed), or `-1` on a terminal
/// error.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> isize {
    loop {
        wait_fd(fd, READABLE, 0);
        let ret = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags) };
        if ret < 0 && is_retryable(errno(), &[libc::EINTR, libc::EWOULDBLOCK, libc::EAGAIN]) {
            debug!("recv on fd {fd} would block, retrying");
            continue;
        }
        return ret as isize;
    }
}

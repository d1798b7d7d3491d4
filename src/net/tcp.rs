//! `TcpListener`/`TcpStream` convenience wrappers over the raw socket
//! helpers, matching the retry-then-wait shape of the teacher's
//! `net/tcp.rs` (there built on `mio`; here on [`crate::net::raw`]).

use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use log::debug;

use super::raw;

fn last_error() -> io::Error {
    io::Error::last_os_error()
}

/// Packs a `SocketAddr` into the `(sockaddr_storage, socklen_t)` pair the
/// raw `bind`/`connect` syscalls expect.
fn pack_addr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = sockaddr_in_from(v4);
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = sockaddr_in6_from(v6);
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_in_from(v4: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: v4.port().to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
        sin_zero: [0; 8],
    }
}

fn sockaddr_in6_from(v6: SocketAddrV6) -> libc::sockaddr_in6 {
    libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: v6.port().to_be(),
        sin6_flowinfo: v6.flowinfo(),
        sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
        sin6_scope_id: v6.scope_id(),
    }
}

fn domain_for(addr: &SocketAddr) -> i32 {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

fn resolve_first<A: ToSocketAddrs>(addr: A) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no addresses to bind/connect to"))
}

pub struct TcpListener {
    fd: RawFd,
}

impl TcpListener {
    /// Bind and listen on `addr`, returning a listener whose `accept`
    /// suspends the calling coroutine rather than blocking the thread.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
        let addr = resolve_first(addr)?;
        let fd = raw::socket(domain_for(&addr), libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(last_error());
        }
        let (storage, len) = pack_addr(addr);
        let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            let err = last_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let ret = unsafe { libc::listen(fd, 1024) };
        if ret < 0 {
            let err = last_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(TcpListener { fd })
    }

    /// Accept one connection, suspending the calling coroutine until the
    /// listener is readable.
    pub fn accept(&self) -> io::Result<TcpStream> {
        debug!("TcpListener: accepting on fd {}", self.fd);
        let fd = raw::accept(self.fd);
        if fd < 0 {
            return Err(last_error());
        }
        Ok(TcpStream { fd })
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

pub struct TcpStream {
    fd: RawFd,
}

impl TcpStream {
    /// Connect to `addr`, suspending the calling coroutine until the
    /// socket is writable (or the connection fails).
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<TcpStream> {
        let addr = resolve_first(addr)?;
        let fd = raw::socket(domain_for(&addr), libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(last_error());
        }
        let (storage, len) = pack_addr(addr);
        let ret = raw::connect(fd, &storage as *const _ as *const libc::sockaddr, len);
        if ret < 0 {
            let err = last_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(TcpStream { fd })
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = raw::recv(self.fd, buf, 0);
        if n < 0 {
            return Err(last_error());
        }
        Ok(n as usize)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = raw::send(self.fd, buf, 0);
        if n < 0 {
            return Err(last_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

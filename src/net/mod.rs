//! Coroutine-aware networking: raw non-blocking socket helpers and the
//! `TcpListener`/`TcpStream` wrappers built on top of them.

pub mod raw;
mod tcp;

pub use tcp::{TcpListener, TcpStream};

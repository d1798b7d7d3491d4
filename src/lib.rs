//! A single-threaded, stackful coroutine runtime with an `epoll`-driven
//! I/O reactor.
//!
//! Every coroutine runs on one shared execution stack and is switched in
//! and out via `ucontext.h`; the live portion of the stack is saved to
//! (and restored from) a per-coroutine buffer across a suspension. A
//! thread-local [`scheduler`] owns the ready queue, the wait table, and
//! the sleep set, and drives the reactor when there is nothing left to
//! run immediately.
//!
//! ```no_run
//! coroutine::spawn(|| {
//!     println!("hello from a coroutine");
//!     coroutine::yield_now();
//!     println!("resumed");
//! });
//! coroutine::run();
//! ```

mod context;
mod coroutine;
mod reactor;
mod scheduler;
mod time;

pub mod builder;
pub mod error;
pub mod net;

pub use builder::Builder;
pub use coroutine::CoroutineId;
pub use error::SchedulerError;
pub use scheduler::{
    current_id, run, self_cancel, set_deadline_ms, sleep_ms, spawn, spawn_named, wait_fd, yield_now,
};

pub use reactor::{READABLE, WRITABLE};

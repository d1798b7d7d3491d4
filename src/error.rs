//! Error types for the fallible setup paths of the runtime.
//!
//! Everything else in this crate follows the source's contract-violation
//! policy: a misused suspension primitive aborts via `panic!`/`assert!`
//! rather than returning a `Result`. Only reactor construction, which can
//! fail for ordinary runtime reasons (out of file descriptors), is typed.

use std::io;
use thiserror::Error;

/// Failure constructing a [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// `epoll_create1` failed.
    #[error("failed to initialize the epoll reactor")]
    ReactorInit(#[source] io::Error),
}

//! The coroutine object: entry closure, lifecycle state, saved-stack
//! buffer, and the wait/sleep metadata the scheduler reads and writes.

use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};

use log::error;

use crate::context::Context;
use crate::scheduler;

/// Identifies a coroutine within its scheduler. Stable for the
/// coroutine's whole lifetime; never reused while the coroutine it named
/// is still reachable from `ready`/`waits`/`sleeps`.
pub type CoroutineId = usize;

/// Execution-stack state, independent of which scheduler container (if
/// any) currently owns the coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecStatus {
    Ready,
    Running,
    Suspended,
}

/// Which scheduler container currently owns the coroutine. `Hang` means
/// "none of them" — the coroutine is on the execution stack (running or
/// mid-transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueStatus {
    Hang,
    InReady,
    InWait,
    InSleep,
}

/// A user task: its entry closure plus everything the scheduler needs to
/// suspend and resume it.
///
/// The spec's language-neutral `entry(param)` pair is realized here as a
/// single boxed `FnOnce`, the idiomatic Rust equivalent — `param` is
/// simply whatever the closure captures.
pub(crate) struct Coroutine {
    pub(crate) id: CoroutineId,
    pub(crate) name: Option<String>,
    entry: Option<Box<dyn FnOnce()>>,
    pub(crate) exec_status: ExecStatus,
    pub(crate) queue_status: QueueStatus,
    pub(crate) saved_stack: Vec<u8>,
    pub(crate) ctx: Context,
    pub(crate) waiting_fd: Option<RawFd>,
    pub(crate) wake_at_us: u64,
    pub(crate) deadline_us: u64,
    pub(crate) dead: bool,
}

impl Coroutine {
    pub(crate) fn new(id: CoroutineId, name: Option<String>, entry: Box<dyn FnOnce()>) -> Coroutine {
        Coroutine {
            id,
            name,
            entry: Some(entry),
            exec_status: ExecStatus::Ready,
            queue_status: QueueStatus::Hang,
            saved_stack: Vec::new(),
            ctx: Context::empty(),
            waiting_fd: None,
            wake_at_us: 0,
            deadline_us: 0,
            dead: false,
        }
    }

    /// `deadline_us != 0 && now() > deadline_us`.
    pub(crate) fn is_expired(&self, now_us: u64) -> bool {
        self.deadline_us != 0 && now_us > self.deadline_us
    }

    pub(crate) fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    /// Copy the live portion of the shared execution stack into
    /// `saved_stack`. Called from inside the running coroutine, so `sp`
    /// must be the address of a local variable in the running
    /// coroutine's current frame.
    ///
    /// # Safety
    ///
    /// `sp` must lie within `[stack_region.as_ptr(), stack_high)` and the
    /// stack must grow downward (true of every target this crate
    /// supports).
    pub(crate) unsafe fn save_stack(&mut self, sp: *const u8, stack_high: *const u8, stack_region_size: usize) {
        assert!(stack_high > sp, "stack pointer is above the shared region's high address");
        let distance = stack_high as usize - sp as usize;
        assert!(distance < stack_region_size, "live stack ({distance} bytes) exceeds the shared region");
        self.saved_stack.resize(distance, 0);
        std::ptr::copy_nonoverlapping(sp, self.saved_stack.as_mut_ptr(), distance);
    }
}

/// The function installed as every coroutine's context entry point. Runs
/// on the shared execution stack; `arg` is the coroutine's id packed into
/// a pointer-sized value.
///
/// A panic inside the entry closure is caught here so it can never
/// unwind across the context-switch boundary into the scheduler.
pub(crate) extern "C" fn exec_trampoline(arg: *mut std::os::raw::c_void) {
    let id = arg as usize;

    let entry = scheduler::with_current_scheduler(|sched| {
        sched.coroutine_mut(id).entry.take().expect("coroutine entry missing at trampoline start")
    });

    let result = panic::catch_unwind(AssertUnwindSafe(entry));

    scheduler::with_current_scheduler(|sched| {
        let co = sched.coroutine_mut(id);
        if let Err(payload) = result {
            let msg = panic_message(&payload);
            error!("coroutine {} ('{}') panicked: {msg}", co.id, co.display_name());
        }
        co.dead = true;
        // `resume` never got a matching "clear current" from this
        // coroutine's side, since it finishes by returning (into
        // `uc_link`) rather than by suspending through `yield_now`/
        // `wait_fd`/`sleep_ms`. Clear it here, same as the original's
        // `schedule_->cur_ = nullptr;` in `exec()`, or the next `resume`
        // call trips its "already current" assertion.
        sched.current = None;
        sched.push_ready(id);
    });
    // Returning here transfers control to `uc_link` (the scheduler's main
    // context), installed when this coroutine's context was created. The
    // reap itself happens on the next `ready` pop in `run_once`, which
    // already skips and removes any dead/expired coroutine before
    // resuming it.
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Box<dyn Any>"
    }
}

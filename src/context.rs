//! The context switch primitive: save/restore CPU register state and the
//! stack pointer between the scheduler's main context and a coroutine's
//! context.
//!
//! Implemented directly over POSIX `ucontext.h`, the same mechanism the
//! original source used, rather than hand-written per-architecture
//! assembly: `getcontext`/`makecontext`/`swapcontext` already give us
//! `capture`, `install_entry`, and `swap` with no extra moving parts.

use std::mem;
use std::os::raw::c_void;

use log::trace;

/// A function `makecontext` will run when a context is first switched
/// into. Receives a single, caller-chosen pointer-sized argument.
pub type EntryFn = extern "C" fn(*mut c_void);

/// Opaque saved CPU state plus the stack it runs on.
///
/// `Context` never allocates; the stack it points `uc_stack` at is owned
/// by whoever calls `install_entry` (the scheduler's shared execution
/// buffer, in this crate).
pub struct Context {
    ctx: libc::ucontext_t,
}

impl Context {
    /// A context with no meaningful state. Used for slots that will be
    /// filled in by `capture` or `install_entry` before first use.
    pub fn empty() -> Context {
        Context { ctx: unsafe { mem::zeroed() } }
    }

    /// Record the current CPU register state into `self`.
    pub fn capture(&mut self) {
        let ret = unsafe { libc::getcontext(&mut self.ctx) };
        assert_eq!(ret, 0, "getcontext failed");
    }

    /// Configure `self` so that switching into it begins executing
    /// `entry(arg)` on `stack`. When `entry` returns, control transfers
    /// to `link`.
    ///
    /// # Safety
    ///
    /// `stack` and `link` must outlive every switch into `self`.
    pub unsafe fn install_entry(&mut self, stack: &mut [u8], link: *mut Context, entry: EntryFn, arg: *mut c_void) {
        let ret = libc::getcontext(&mut self.ctx);
        assert_eq!(ret, 0, "getcontext failed");

        self.ctx.uc_stack.ss_sp = stack.as_mut_ptr() as *mut c_void;
        self.ctx.uc_stack.ss_size = stack.len();
        self.ctx.uc_stack.ss_flags = 0;
        self.ctx.uc_link = if link.is_null() { std::ptr::null_mut() } else { &mut (*link).ctx };

        // makecontext's C signature is variadic and declares its entry
        // point as taking no arguments; the real argument is a single
        // pointer-width value passed through the varargs slot, which the
        // SysV ABI places in the first integer argument register either
        // way.
        let trampoline: extern "C" fn() = mem::transmute(entry);
        libc::makecontext(&mut self.ctx, Some(trampoline), 1, arg);
        trace!("installed entry on a {}-byte stack", stack.len());
    }

    /// Save the current CPU state into `from` and restore it from `to`,
    /// atomically transferring control.
    ///
    /// # Safety
    ///
    /// `to` must have been produced by `capture` or `install_entry`.
    pub unsafe fn swap(from: &mut Context, to: &Context) {
        trace!("swapcontext");
        let ret = libc::swapcontext(&mut from.ctx, &to.ctx);
        assert_eq!(ret, 0, "swapcontext failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn swap_round_trips_through_entry() {
        thread_local! {
            static SEEN: Cell<u32> = Cell::new(0);
        }

        extern "C" fn run(arg: *mut c_void) {
            SEEN.with(|s| s.set(arg as usize as u32));
        }

        let mut stack = vec![0u8; 256 * 1024];
        let mut main_ctx = Context::empty();
        let mut child_ctx = Context::empty();

        unsafe {
            child_ctx.install_entry(&mut stack, &mut main_ctx, run, 42usize as *mut c_void);
            Context::swap(&mut main_ctx, &child_ctx);
        }

        assert_eq!(SEEN.with(|s| s.get()), 42);
    }
}

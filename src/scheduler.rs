//! The scheduler: the thread-local singleton that owns every live
//! coroutine, the ready/wait/sleep containers, the shared execution
//! stack, and the main context the run loop itself executes on.

use std::cell::UnsafeCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::raw::c_void;
use std::os::unix::io::RawFd;

use log::{debug, info, trace};
use slab::Slab;

use crate::context::Context;
use crate::coroutine::{exec_trampoline, Coroutine, CoroutineId, ExecStatus, QueueStatus};
use crate::error::SchedulerError;
use crate::reactor::Reactor;
use crate::time::now_us;

/// Size of the single execution stack shared by every coroutine.
pub(crate) const EXEC_STACK_SIZE: usize = 1024 * 1024;

/// Fallback block time when nothing is ready and nothing is sleeping:
/// the run loop still needs *some* poll timeout, and there's no sleeper
/// to derive one from.
const IDLE_POLL_US: u64 = 1_000_000;

pub(crate) struct Scheduler {
    ready: VecDeque<CoroutineId>,
    waits: HashMap<RawFd, CoroutineId>,
    sleeps: BTreeMap<u64, CoroutineId>,
    coroutines: Slab<Coroutine>,
    exec_stack: Vec<u8>,
    main_ctx: Context,
    current: Option<CoroutineId>,
    reactor: Reactor,
}

// `Scheduler` is only ever reached through the thread-local below, and
// every public entry point asserts it is driven from a single OS thread.
// The reactor's raw epoll fd and the raw stack pointers stored in
// `Coroutine`/`Context` are why it can't be `Send`/`Sync` on its own
// merits; we don't need it to be, since it never crosses a thread
// boundary.
thread_local! {
    static SCHEDULER: UnsafeCell<Option<Scheduler>> = const { UnsafeCell::new(None) };
}

/// Runs `f` with mutable access to this thread's scheduler, lazily
/// constructing it on first use.
///
/// # Safety / re-entrancy
///
/// This is deliberately backed by an `UnsafeCell`, not a `RefCell`. A
/// suspension primitive (`yield_now`, `wait_fd`, ...) calls this function,
/// then performs a raw context switch *while the caller's own call into
/// `with_current_scheduler` is still formally on the stack* (the switch
/// suspends that stack frame; it doesn't return through it). A `RefCell`
/// would see that as a reentrant borrow and panic the moment the resumed
/// coroutine called back in. Soundness instead rests on the scheduling
/// invariant this whole crate enforces: exactly one logical piece of code
/// touches the scheduler at any instant, because only one coroutine (or
/// the scheduler loop itself) is ever actually running. This is the same
/// trade the teacher crate makes in `environment.rs`'s
/// `COROUTINE_ENVIRONMENT: UnsafeCell<Box<Environment>>`.
///
/// # Panics
///
/// Panics if the epoll reactor cannot be created (see
/// [`SchedulerError`]) — there is no caller above the first `spawn`/
/// `run` call to hand a `Result` to, so a singleton-style construction
/// failure is treated as fatal, same as any other contract violation in
/// this crate.
pub(crate) fn with_current_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    SCHEDULER.with(|cell| {
        let opt = unsafe { &mut *cell.get() };
        if opt.is_none() {
            *opt = Some(Scheduler::new().expect("failed to initialize the epoll reactor"));
        }
        f(opt.as_mut().expect("scheduler just initialized"))
    })
}

impl Scheduler {
    pub(crate) fn new() -> Result<Scheduler, SchedulerError> {
        Ok(Scheduler {
            ready: VecDeque::new(),
            waits: HashMap::new(),
            sleeps: BTreeMap::new(),
            coroutines: Slab::new(),
            exec_stack: vec![0u8; EXEC_STACK_SIZE],
            main_ctx: Context::empty(),
            current: None,
            reactor: Reactor::new()?,
        })
    }

    fn stack_high(&self) -> *const u8 {
        unsafe { self.exec_stack.as_ptr().add(self.exec_stack.len()) }
    }

    pub(crate) fn push_ready(&mut self, id: CoroutineId) {
        self.coroutines[id].queue_status = QueueStatus::InReady;
        self.ready.push_back(id);
    }

    /// Create and enqueue a new coroutine. Returns its id.
    pub(crate) fn spawn(&mut self, name: Option<String>, entry: Box<dyn FnOnce()>) -> CoroutineId {
        let id = self.coroutines.insert(Coroutine::new(0, name, entry));
        self.coroutines[id].id = id;
        self.push_ready(id);
        debug!("spawned coroutine {id}");
        id
    }

    pub(crate) fn coroutine_mut(&mut self, id: CoroutineId) -> &mut Coroutine {
        self.coroutines.get_mut(id).expect("unknown coroutine id")
    }

    /// One pass of the outer run loop: drain `ready`, then compute the
    /// next poll deadline from `sleeps`, then block in the reactor.
    fn run_once(&mut self) {
        while let Some(id) = self.ready.pop_front() {
            let now = now_us();
            let (dead, expired) = {
                let co = &self.coroutines[id];
                (co.dead, co.is_expired(now))
            };
            if dead || expired {
                debug!("reaping coroutine {id} ({})", if dead { "dead" } else { "expired" });
                self.coroutines.remove(id);
                continue;
            }
            self.resume(id);
        }

        let mut usec = self.process_sleeps();
        if !self.ready.is_empty() {
            usec = 0;
        }
        trace!("polling reactor for {usec}us");
        let events = self.reactor.poll(usec);
        for (fd, _events) in events {
            let id = self.waits.remove(&fd).expect("reactor reported an fd with no waiter");
            self.push_ready(id);
        }
    }

    /// Drives the scheduler until `ready`, `waits`, and `sleeps` are all
    /// empty.
    pub(crate) fn run(&mut self) {
        info!("scheduler run loop starting");
        while !(self.ready.is_empty() && self.waits.is_empty() && self.sleeps.is_empty()) {
            self.run_once();
        }
        info!("scheduler run loop finished");
    }

    /// Moves every sleeper whose wake time has passed into `ready`, in
    /// ascending wake-time order. Returns the microseconds to wait before
    /// the next sleeper is due, or a fallback when nothing would ever
    /// wake the reactor poll on its own.
    fn process_sleeps(&mut self) -> u64 {
        if self.sleeps.is_empty() {
            return if self.ready.is_empty() { IDLE_POLL_US } else { 0 };
        }

        let now = now_us();
        let head = *self.sleeps.keys().next().unwrap();
        if head > now {
            return head - now;
        }

        let due: Vec<u64> = self.sleeps.range(..=now).map(|(k, _)| *k).collect();
        for key in due {
            let id = self.sleeps.remove(&key).unwrap();
            self.push_ready(id);
        }
        0
    }

    /// Resume a coroutine that is READY or SUSPENDED.
    fn resume(&mut self, id: CoroutineId) {
        let stack_high = self.stack_high();
        let stack_ptr = self.exec_stack.as_mut_ptr();
        let stack_len = self.exec_stack.len();
        let main_ctx_ptr: *mut Context = &mut self.main_ctx;

        let co = self.coroutines.get_mut(id).expect("resume: unknown coroutine id");
        match co.exec_status {
            ExecStatus::Ready => {
                let arg = id as *mut c_void;
                unsafe {
                    let stack_slice = std::slice::from_raw_parts_mut(stack_ptr, stack_len);
                    co.ctx.install_entry(stack_slice, main_ctx_ptr, exec_trampoline, arg);
                }
            }
            ExecStatus::Suspended => unsafe {
                let dst = stack_high.sub(co.saved_stack.len()) as *mut u8;
                std::ptr::copy_nonoverlapping(co.saved_stack.as_ptr(), dst, co.saved_stack.len());
            },
            ExecStatus::Running => unreachable!("attempted to resume a running coroutine"),
        }

        co.exec_status = ExecStatus::Running;
        co.queue_status = QueueStatus::Hang;
        let co_ctx_ptr: *mut Context = &mut co.ctx;

        assert!(self.current.is_none(), "resume called while another coroutine is current");
        self.current = Some(id);

        unsafe { Context::swap(&mut *main_ctx_ptr, &*co_ctx_ptr) }
        // Control returns here once `id` suspends or finishes. `current`
        // was already cleared by whichever suspension path ran.
    }

    fn current_id(&self) -> CoroutineId {
        self.current.expect("called outside a running coroutine")
    }
}

/// The two raw context pointers a suspension needs, computed while the
/// scheduler's thread-local storage is "borrowed" and used immediately
/// after that access ends (see `with_current_scheduler`'s safety note).
struct PendingSwap {
    from: *mut Context,
    to: *const Context,
    save: Option<PendingSave>,
}

/// Deferred stack-save parameters for a suspending (not finishing)
/// coroutine.
///
/// The save itself must happen here, inside `do_swap`, rather than back
/// in the `with_current_scheduler` closure that builds this struct: that
/// closure runs in `yield_now`/`wait_fd`/`sleep_ms`'s own frame, one or
/// more calls above the frame that actually invokes `swapcontext`. A
/// marker taken there sits *above* the stack pointer `swapcontext` saves,
/// so `save_stack`'s `[marker, stack_high)` range would miss the very
/// frames (`do_swap`, `Context::swap`) the saved context resumes through
/// — restoring only `[marker, stack_high)` later and then switching into
/// a context whose SP points below that range is undefined behavior.
/// Taking the marker here, in the same frame that calls `Context::swap`,
/// keeps the copied region covering everything the resume returns
/// through.
struct PendingSave {
    co: *mut Coroutine,
    stack_high: *const u8,
    stack_len: usize,
}

unsafe fn do_swap(pending: PendingSwap) {
    if let Some(save) = pending.save {
        let marker: u8 = 0;
        let sp = &marker as *const u8;
        (*save.co).save_stack(sp, save.stack_high, save.stack_len);
    }
    Context::swap(&mut *pending.from, &*pending.to)
}

/// Spawn a new coroutine running `f`, enqueued on `ready`.
pub fn spawn(f: impl FnOnce() + 'static) -> CoroutineId {
    with_current_scheduler(|sched| sched.spawn(None, Box::new(f)))
}

/// Spawn a new coroutine running `f`, with a name used only in logs and
/// panic messages.
pub fn spawn_named(name: impl Into<String>, f: impl FnOnce() + 'static) -> CoroutineId {
    with_current_scheduler(|sched| sched.spawn(Some(name.into()), Box::new(f)))
}

/// The id of the running coroutine.
///
/// # Panics
///
/// Panics if called outside a coroutine (i.e. from the scheduler's own
/// call stack before any coroutine has been resumed).
pub fn current_id() -> CoroutineId {
    with_current_scheduler(|sched| sched.current_id())
}

/// Record an absolute deadline (relative to now) after which the current
/// coroutine will be reaped at the next scheduler turn that inspects it,
/// regardless of whether it is runnable.
pub fn set_deadline_ms(ms: u64) {
    with_current_scheduler(|sched| {
        let id = sched.current_id();
        sched.coroutines[id].deadline_us = now_us() + ms * 1000;
    });
}

/// Drive this thread's scheduler until every queue and map is empty.
pub fn run() {
    with_current_scheduler(|sched| sched.run());
}

/// Re-queue the current coroutine at the tail of `ready` and suspend
/// until the scheduler resumes it.
pub fn yield_now() {
    let pending = with_current_scheduler(|sched| {
        let id = sched.current_id();
        sched.push_ready(id);

        let stack_high = sched.stack_high();
        let stack_len = sched.exec_stack.len();
        let main_ctx_ptr: *const Context = &sched.main_ctx;

        let co = sched.coroutines.get_mut(id).expect("current coroutine missing from slab");
        co.exec_status = ExecStatus::Suspended;
        let ctx_ptr: *mut Context = &mut co.ctx;
        let co_ptr: *mut Coroutine = co;

        sched.current = None;
        PendingSwap { from: ctx_ptr, to: main_ctx_ptr, save: Some(PendingSave { co: co_ptr, stack_high, stack_len }) }
    });

    unsafe { do_swap(pending) };
}

/// Suspend the current coroutine until `fd` is ready for `events`
/// (an `EPOLLIN`/`EPOLLOUT` bitmask — see [`crate::reactor`]). The
/// `timeout_us` parameter is accepted for interface completeness and not
/// enforced at this layer; see DESIGN.md for why.
pub fn wait_fd(fd: RawFd, events: u32, timeout_us: u64) {
    let _ = timeout_us;

    let pending = with_current_scheduler(|sched| {
        let id = sched.current_id();
        assert!(!sched.waits.contains_key(&fd), "duplicate wait on fd {fd}");
        sched.waits.insert(fd, id);
        sched.reactor.add(fd, events);

        let stack_high = sched.stack_high();
        let stack_len = sched.exec_stack.len();
        let main_ctx_ptr: *const Context = &sched.main_ctx;

        let co = sched.coroutines.get_mut(id).expect("current coroutine missing from slab");
        co.exec_status = ExecStatus::Suspended;
        co.queue_status = QueueStatus::InWait;
        co.waiting_fd = Some(fd);
        let ctx_ptr: *mut Context = &mut co.ctx;
        let co_ptr: *mut Coroutine = co;

        sched.current = None;
        PendingSwap { from: ctx_ptr, to: main_ctx_ptr, save: Some(PendingSave { co: co_ptr, stack_high, stack_len }) }
    });

    unsafe { do_swap(pending) };

    with_current_scheduler(|sched| {
        sched.reactor.remove(fd, events);
        let id = sched.current_id();
        sched.coroutines[id].waiting_fd = None;
    });
}

/// Suspend the current coroutine for at least `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    let pending = with_current_scheduler(|sched| {
        let id = sched.current_id();
        let mut wake_at = now_us() + ms * 1000;
        while sched.sleeps.contains_key(&wake_at) {
            wake_at += 1;
        }
        sched.sleeps.insert(wake_at, id);

        let stack_high = sched.stack_high();
        let stack_len = sched.exec_stack.len();
        let main_ctx_ptr: *const Context = &sched.main_ctx;

        let co = sched.coroutines.get_mut(id).expect("current coroutine missing from slab");
        co.exec_status = ExecStatus::Suspended;
        co.queue_status = QueueStatus::InSleep;
        co.wake_at_us = wake_at;
        let ctx_ptr: *mut Context = &mut co.ctx;
        let co_ptr: *mut Coroutine = co;

        sched.current = None;
        PendingSwap { from: ctx_ptr, to: main_ctx_ptr, save: Some(PendingSave { co: co_ptr, stack_high, stack_len }) }
    });

    unsafe { do_swap(pending) };
}

/// Terminate the current coroutine. Never returns.
///
/// Unlike the original source, which simply abandons a cancelled
/// coroutine's storage (a leak — see DESIGN.md), this implementation
/// re-queues it onto `ready` so the normal reap path in `run_once`
/// frees its slab slot, keeping the invariant in spec §3/§8 that every
/// coroutine is destroyed by being popped from `ready` with `dead` set.
pub fn self_cancel() -> ! {
    let pending = with_current_scheduler(|sched| {
        let id = sched.current_id();
        sched.coroutines[id].dead = true;
        sched.push_ready(id);
        sched.current = None;

        let main_ctx_ptr: *const Context = &sched.main_ctx;
        let co_ctx_ptr: *mut Context = &mut sched.coroutines[id].ctx;
        PendingSwap { from: co_ctx_ptr, to: main_ctx_ptr, save: None }
    });

    unsafe { do_swap(pending) };
    unreachable!("a cancelled coroutine's context must never be resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn single_coroutine_runs_to_completion() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        spawn(move || {
            log2.borrow_mut().push(42);
        });
        run();
        assert_eq!(*log.borrow(), vec![42]);
    }

    #[test]
    fn two_yielders_interleave() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let l1 = log.clone();
        spawn(move || {
            l1.borrow_mut().push("A1");
            yield_now();
            l1.borrow_mut().push("A2");
        });

        let l2 = log.clone();
        spawn(move || {
            l2.borrow_mut().push("B1");
            yield_now();
            l2.borrow_mut().push("B2");
        });

        run();
        assert_eq!(*log.borrow(), vec!["A1", "B1", "A2", "B2"]);
    }

    #[test]
    fn sleep_ordering() {
        let log = Rc::new(RefCell::new(Vec::new()));

        let la = log.clone();
        spawn(move || {
            sleep_ms(30);
            la.borrow_mut().push("A");
        });
        let lb = log.clone();
        spawn(move || {
            sleep_ms(10);
            lb.borrow_mut().push("B");
        });
        let lc = log.clone();
        spawn(move || {
            sleep_ms(20);
            lc.borrow_mut().push("C");
        });

        run();
        assert_eq!(*log.borrow(), vec!["B", "C", "A"]);
    }

    #[test]
    fn deadline_expiry_skips_entry() {
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();

        with_current_scheduler(|sched| {
            let id = sched.spawn(None, Box::new(move || {
                *ran2.borrow_mut() = true;
            }));
            sched.coroutines[id].deadline_us = now_us() + 10_000;
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        run();
        assert!(!*ran.borrow(), "entry must never run once its deadline has expired");
    }

    #[test]
    fn deadline_expires_while_sleeping() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();

        spawn(move || {
            log2.borrow_mut().push("before-sleep");
            set_deadline_ms(10);
            sleep_ms(100);
            log2.borrow_mut().push("after-sleep");
        });

        run();
        assert_eq!(
            *log.borrow(),
            vec!["before-sleep"],
            "a deadline that passes during a sleep must be reaped once the sleep wakes, not resumed past it"
        );
    }

    #[test]
    fn self_cancel_terminates_without_running_past_it() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l1 = log.clone();
        spawn(move || {
            l1.borrow_mut().push(1);
            self_cancel();
        });
        run();
        assert_eq!(*log.borrow(), vec![1]);
    }
}

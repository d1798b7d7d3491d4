//! Coroutine configuration builder, mirroring the teacher's
//! `Builder` (`name`/`stack_size` chain) reduced to what this design's
//! single shared execution stack actually lets a caller configure.

use crate::coroutine::CoroutineId;
use crate::scheduler::{self, with_current_scheduler};

/// Configures and spawns a new coroutine.
///
/// ```
/// coroutine::Builder::new()
///     .name("worker-1".to_string())
///     .spawn(|| println!("hello"));
/// ```
pub struct Builder {
    name: Option<String>,
}

impl Builder {
    /// Start building a coroutine with no name set.
    pub fn new() -> Builder {
        Builder { name: None }
    }

    /// Name the coroutine-to-be. Used only for identification in logs
    /// and panic messages; this crate has no per-coroutine stack size to
    /// configure since every coroutine runs on the single shared stack.
    pub fn name(mut self, name: String) -> Builder {
        self.name = Some(name);
        self
    }

    /// Spawn the configured coroutine and return its id.
    pub fn spawn(self, f: impl FnOnce() + 'static) -> CoroutineId {
        with_current_scheduler(|sched| sched.spawn(self.name, Box::new(f)))
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn named_spawn_runs() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        Builder::new().name("t1".to_string()).spawn(move || {
            log2.borrow_mut().push(1);
        });
        scheduler::run();
        assert_eq!(*log.borrow(), vec![1]);
    }
}

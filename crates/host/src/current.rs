//! The host whose scheduler thread is the calling thread.

use std::cell::RefCell;

use crate::host::LoopHost;

thread_local! {
    static CURRENT: RefCell<Option<LoopHost>> = const { RefCell::new(None) };
}

/// The host driving the calling thread, if the caller runs on a scheduler
/// thread (inside a callback, job or coroutine).
pub fn current_loop() -> Option<LoopHost> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Restores the previous current host when dropped.
pub(crate) struct EnterGuard {
    previous: Option<LoopHost>,
}

pub(crate) fn enter(host: LoopHost) -> EnterGuard {
    let previous = CURRENT.with(|current| current.replace(Some(host)));
    EnterGuard { previous }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

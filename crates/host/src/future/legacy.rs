use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use loopbridge_core::{LoopError, SharedError};

type DoneCallback<T> = Box<dyn FnOnce(&LegacyFuture<T>) + Send + 'static>;
type CancelHandler = Arc<dyn Fn() + Send + Sync + 'static>;

/// Identifies a registered done callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

enum FutureState<T> {
    Pending,
    Done(T),
    Failed(SharedError),
    Cancelled,
}

struct FutureInner<T> {
    state: FutureState<T>,
    callbacks: Vec<(CallbackId, DoneCallback<T>)>,
    next_callback: u64,
    cancel_handler: Option<CancelHandler>,
    cancel_requests: usize,
}

/// A callback-based future in the style of the legacy loop.
///
/// Completion is pushed in from outside (`set_result`, `set_exception`,
/// `set_cancelled`) and observed through done callbacks. Cloning yields another
/// handle to the same future.
pub struct LegacyFuture<T> {
    inner: Arc<Mutex<FutureInner<T>>>,
}

impl<T> Clone for LegacyFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for LegacyFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        let state = match inner.state {
            FutureState::Pending => "pending",
            FutureState::Done(_) => "done",
            FutureState::Failed(_) => "failed",
            FutureState::Cancelled => "cancelled",
        };
        f.debug_struct("LegacyFuture")
            .field("state", &state)
            .field("callbacks", &inner.callbacks.len())
            .finish()
    }
}

impl<T> Default for LegacyFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LegacyFuture<T> {
    /// A plain future: `cancel()` completes it as cancelled immediately.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A task-like future: `cancel()` only calls `handler`, and the producer
    /// acknowledges later with [`set_cancelled`](Self::set_cancelled) (or
    /// finishes some other way).
    pub fn with_cancel_handler(handler: impl Fn() + Send + Sync + 'static) -> Self {
        Self::build(Some(Arc::new(handler)))
    }

    fn build(cancel_handler: Option<CancelHandler>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FutureInner {
                state: FutureState::Pending,
                callbacks: Vec::new(),
                next_callback: 0,
                cancel_handler,
                cancel_requests: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FutureInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn done(&self) -> bool {
        !matches!(self.lock().state, FutureState::Pending)
    }

    pub fn cancelled(&self) -> bool {
        matches!(self.lock().state, FutureState::Cancelled)
    }

    /// How many times cancellation was requested while pending.
    pub fn cancel_requests(&self) -> usize {
        self.lock().cancel_requests
    }

    pub fn callback_count(&self) -> usize {
        self.lock().callbacks.len()
    }

    pub fn set_result(&self, value: T) -> Result<(), LoopError> {
        self.complete(FutureState::Done(value))
    }

    pub fn set_exception(&self, err: LoopError) -> Result<(), LoopError> {
        self.complete(FutureState::Failed(err.into_shared()))
    }

    /// Acknowledge cancellation. Returns `false` if already done.
    pub fn set_cancelled(&self) -> bool {
        self.complete(FutureState::Cancelled).is_ok()
    }

    /// Request cancellation. Returns `false` if the future is already done.
    pub fn cancel(&self) -> bool {
        let handler = {
            let mut inner = self.lock();
            if !matches!(inner.state, FutureState::Pending) {
                return false;
            }
            inner.cancel_requests += 1;
            inner.cancel_handler.clone()
        };
        match handler {
            Some(handler) => handler(),
            None => {
                self.set_cancelled();
            }
        }
        true
    }

    /// Register `callback` to run once the future completes. Runs it right
    /// away when the future is already done.
    pub fn add_done_callback(
        &self,
        callback: impl FnOnce(&LegacyFuture<T>) + Send + 'static,
    ) -> CallbackId {
        let mut inner = self.lock();
        let id = CallbackId(inner.next_callback);
        inner.next_callback += 1;
        if matches!(inner.state, FutureState::Pending) {
            inner.callbacks.push((id, Box::new(callback)));
        } else {
            drop(inner);
            callback(self);
        }
        id
    }

    /// Returns whether the callback was still registered.
    pub fn remove_done_callback(&self, id: CallbackId) -> bool {
        let mut inner = self.lock();
        let before = inner.callbacks.len();
        inner.callbacks.retain(|(cb_id, _)| *cb_id != id);
        inner.callbacks.len() != before
    }

    fn complete(&self, state: FutureState<T>) -> Result<(), LoopError> {
        let callbacks = {
            let mut inner = self.lock();
            if !matches!(inner.state, FutureState::Pending) {
                return Err(LoopError::IllegalState("future is already done".into()));
            }
            inner.state = state;
            inner.cancel_handler = None;
            std::mem::take(&mut inner.callbacks)
        };
        for (_, callback) in callbacks {
            callback(self);
        }
        Ok(())
    }
}

impl<T: Clone> LegacyFuture<T> {
    /// The outcome of a completed future.
    pub fn result(&self) -> Result<T, LoopError> {
        match &self.lock().state {
            FutureState::Pending => Err(LoopError::IllegalState("result is not ready".into())),
            FutureState::Done(value) => Ok(value.clone()),
            FutureState::Failed(err) => Err(LoopError::from_shared(err.clone())),
            FutureState::Cancelled => Err(LoopError::legacy_cancelled()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_run_once_on_completion() {
        let fut = LegacyFuture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            fut.add_done_callback(move |f: &LegacyFuture<u32>| {
                seen.lock().unwrap().push(f.result().unwrap())
            });
        }
        assert_eq!(fut.callback_count(), 2);
        fut.set_result(9).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![9, 9]);
        assert_eq!(fut.callback_count(), 0);

        let err = fut.set_result(10).unwrap_err();
        assert!(matches!(err, LoopError::IllegalState(_)));
    }

    #[test]
    fn late_callback_runs_immediately() {
        let fut = LegacyFuture::new();
        fut.set_result("ready".to_string()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        fut.add_done_callback(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_callback_never_runs() {
        let fut = LegacyFuture::<u8>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = fut.add_done_callback(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(fut.remove_done_callback(id));
        assert!(!fut.remove_done_callback(id));
        fut.set_result(1).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn plain_cancel_completes_immediately() {
        let fut = LegacyFuture::<u8>::new();
        assert!(fut.cancel());
        assert!(fut.cancelled());
        assert!(!fut.cancel(), "done futures refuse cancellation");
        match fut.result() {
            Err(LoopError::Cancelled { origin, .. }) => {
                assert_eq!(origin, loopbridge_core::CancelOrigin::Legacy)
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn handler_cancel_waits_for_acknowledgement() {
        let requested = Arc::new(AtomicUsize::new(0));
        let r = requested.clone();
        let fut = LegacyFuture::<u8>::with_cancel_handler(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert!(fut.cancel());
        assert_eq!(requested.load(Ordering::SeqCst), 1);
        assert!(!fut.done());
        assert_eq!(fut.cancel_requests(), 1);

        assert!(fut.set_cancelled());
        assert!(fut.cancelled());
    }

    #[test]
    fn exception_is_visible_to_every_reader() {
        let fut = LegacyFuture::<u8>::new();
        fut.set_exception(LoopError::failed("bad input")).unwrap();
        assert_eq!(fut.result().unwrap_err().to_string(), "bad input");
        assert_eq!(fut.result().unwrap_err().to_string(), "bad input");
    }

    #[test]
    fn typed_exception_keeps_its_variant() {
        let fut = LegacyFuture::<u8>::new();
        fut.set_exception(LoopError::Reentrancy).unwrap();
        assert!(matches!(fut.result(), Err(LoopError::Reentrancy)));
        assert!(matches!(fut.result(), Err(LoopError::Reentrancy)));
    }

    #[test]
    fn pending_result_is_illegal() {
        let fut = LegacyFuture::<u8>::new();
        assert!(matches!(fut.result(), Err(LoopError::IllegalState(_))));
    }
}

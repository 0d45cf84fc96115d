use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use loopbridge_core::LoopError;

use super::legacy::LegacyFuture;
use crate::cancel::CancelToken;
use crate::handle::panic_message;

/// Something `run_until_complete` can drive: an existing legacy future or a
/// coroutine that still has to be wrapped into one.
pub enum Awaitable<T> {
    Future(LegacyFuture<T>),
    Coroutine(BoxFuture<'static, Result<T, LoopError>>),
}

impl<T> Awaitable<T> {
    pub fn coroutine<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, LoopError>> + Send + 'static,
    {
        Awaitable::Coroutine(fut.boxed())
    }
}

impl<T: Send + 'static> Awaitable<T> {
    /// Turn into a legacy future, spawning coroutines on the current runtime.
    pub(crate) fn ensure_future(self) -> LegacyFuture<T> {
        match self {
            Awaitable::Future(future) => future,
            Awaitable::Coroutine(coro) => spawn_task(coro),
        }
    }
}

impl<T> From<LegacyFuture<T>> for Awaitable<T> {
    fn from(future: LegacyFuture<T>) -> Self {
        Awaitable::Future(future)
    }
}

/// Run a coroutine as a task on the current runtime and expose it as a
/// legacy future. Cancelling the future stops the coroutine and then
/// acknowledges the cancellation.
pub fn spawn_task<T, F>(coro: F) -> LegacyFuture<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T, LoopError>> + Send + 'static,
{
    let stop = CancelToken::new();
    let future = {
        let stop = stop.clone();
        LegacyFuture::with_cancel_handler(move || {
            stop.cancel();
        })
    };

    let completion = future.clone();
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                completion.set_cancelled();
            }
            outcome = AssertUnwindSafe(coro).catch_unwind() => {
                // Completion can only fail if someone else finished the future first.
                let _ = match outcome {
                    Ok(Ok(value)) => completion.set_result(value),
                    Ok(Err(err)) if err.is_cancelled() => {
                        completion.set_cancelled();
                        Ok(())
                    }
                    Ok(Err(err)) => completion.set_exception(err),
                    Err(panic) => completion.set_exception(LoopError::Panicked(panic_message(&*panic))),
                };
            }
        }
    });

    future
}

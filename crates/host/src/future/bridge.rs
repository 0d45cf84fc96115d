use loopbridge_core::{CancelOrigin, LoopError};
use tokio::sync::oneshot;
use tracing::debug;

use super::legacy::{CallbackId, LegacyFuture};
use crate::cancel::CancelToken;

/// Removes the done callback if the await is abandoned midway.
struct Registration<'a, T> {
    future: &'a LegacyFuture<T>,
    id: CallbackId,
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        self.future.remove_done_callback(self.id);
    }
}

/// Wait for a legacy future from a task running on the scheduler.
///
/// Cancelling `scope` requests cancellation of `future` once and keeps waiting
/// until the future actually completes. If it then reports a legacy
/// cancellation, the caller sees a [`CancelOrigin::Scope`] cancellation with
/// the legacy one chained as its cause. A legacy cancellation nobody on this
/// side asked for is returned as-is.
pub async fn await_future<T>(future: &LegacyFuture<T>, scope: &CancelToken) -> Result<T, LoopError>
where
    T: Clone + Send + 'static,
{
    let (tx, mut rx) = oneshot::channel();
    let id = future.add_done_callback(move |done| {
        let _ = tx.send(done.result());
    });
    let _registration = Registration { future, id };

    let mut scope_cancel = false;
    let outcome = loop {
        tokio::select! {
            biased;
            outcome = &mut rx => {
                break outcome.unwrap_or(Err(LoopError::LoopStopped));
            }
            _ = scope.cancelled(), if !scope_cancel => {
                scope_cancel = true;
                debug!("scope cancelled, forwarding to legacy future");
                future.cancel();
            }
        }
    };

    match outcome {
        Err(err @ LoopError::Cancelled { origin: CancelOrigin::Legacy, .. }) if scope_cancel => {
            Err(LoopError::Cancelled {
                origin: CancelOrigin::Scope,
                cause: Some(Box::new(err)),
            })
        }
        other => other,
    }
}

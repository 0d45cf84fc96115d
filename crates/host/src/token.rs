//! Thread-safe re-entry into the scheduler thread.
//!
//! A [`ReentryToken`] lets any thread ask the scheduler thread to run a
//! synchronous closure soon. Closures run in the order they were sent.

use tokio::sync::mpsc;
use tracing::debug;

use crate::cancel::CancelToken;

pub(crate) type SyncCall = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub struct ReentryToken {
    tx: mpsc::UnboundedSender<SyncCall>,
}

/// Scheduler-side end of a [`ReentryToken`].
pub struct ReentryDrain {
    rx: mpsc::UnboundedReceiver<SyncCall>,
}

impl ReentryToken {
    pub fn new() -> (Self, ReentryDrain) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, ReentryDrain { rx })
    }

    /// Queue `call` for the scheduler thread. When the scheduler is gone the
    /// closure is handed back so the caller can run it itself.
    pub(crate) fn run_sync_soon(&self, call: SyncCall) -> Result<(), SyncCall> {
        self.tx.send(call).map_err(|mpsc::error::SendError(call)| call)
    }
}

impl ReentryDrain {
    /// Run queued closures until `stop` fires, then run whatever is left.
    pub async fn run(mut self, stop: CancelToken) {
        loop {
            tokio::select! {
                biased;
                call = self.rx.recv() => match call {
                    Some(call) => call(),
                    None => return,
                },
                _ = stop.cancelled() => break,
            }
        }

        self.rx.close();
        let mut leftover = 0usize;
        while let Ok(call) = self.rx.try_recv() {
            call();
            leftover += 1;
        }
        if leftover > 0 {
            debug!(leftover, "drained re-entry calls during shutdown");
        }
    }
}

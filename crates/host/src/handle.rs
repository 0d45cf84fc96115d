//! Deferred units of work executed by the pump.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use loopbridge_core::{BoxError, LoopError, SharedError};
use thiserror::Error;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of running a handle other than plain success.
#[derive(Debug, Error)]
pub enum HandleError {
    /// Sentinel raised by control handles to break the pump loop.
    #[error("pump stop requested")]
    StopPump,

    #[error(transparent)]
    Failed(BoxError),

    #[error("callback panicked: {0}")]
    Panicked(String),
}

impl From<HandleError> for LoopError {
    fn from(err: HandleError) -> Self {
        match err {
            HandleError::StopPump => LoopError::LoopStopped,
            HandleError::Failed(e) => LoopError::Failed(SharedError::from_box(e)),
            HandleError::Panicked(msg) => LoopError::Panicked(msg),
        }
    }
}

type Callback = Box<dyn FnOnce() -> Result<(), HandleError> + Send + 'static>;

/// A callback queued for the pump, consumed exactly once.
///
/// Handles carry no reference to their loop; the queue they sit in belongs
/// to exactly one host, and `current_loop()` names it while they run.
pub struct Handle {
    id: u64,
    callback: Callback,
    control: bool,
    cancelled: Arc<AtomicBool>,
}

impl Handle {
    /// An ordinary callback.
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self::build(
            Box::new(move || {
                callback();
                Ok(())
            }),
            false,
        )
    }

    /// An ordinary callback that may fail. Failures are logged by the pump.
    pub fn fallible(callback: impl FnOnce() -> Result<(), BoxError> + Send + 'static) -> Self {
        Self::build(Box::new(move || callback().map_err(HandleError::Failed)), false)
    }

    /// A lifecycle-control handle. Its failures terminate the pump.
    pub(crate) fn control(
        callback: impl FnOnce() -> Result<(), HandleError> + Send + 'static,
    ) -> Self {
        Self::build(Box::new(callback), true)
    }

    fn build(callback: Callback, control: bool) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            callback,
            control,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_control(&self) -> bool {
        self.control
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// A cloneable reference that can cancel this handle before it runs.
    pub fn handle_ref(&self) -> HandleRef {
        HandleRef {
            id: self.id,
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    /// Run the callback unless cancelled. Panics are caught and reported.
    pub(crate) fn run(self) -> Result<(), HandleError> {
        if self.is_cancelled() {
            return Ok(());
        }
        let callback = self.callback;
        match catch_unwind(AssertUnwindSafe(callback)) {
            Ok(outcome) => outcome,
            Err(panic) => Err(HandleError::Panicked(panic_message(&*panic))),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("control", &self.control)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cancellation handle returned when a callback is queued.
#[derive(Debug, Clone)]
pub struct HandleRef {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl HandleRef {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Prevent the callback from running if the pump has not reached it yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

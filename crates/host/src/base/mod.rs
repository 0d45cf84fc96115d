//! The base loop: dispatch queue, pump, stop bookkeeping and registrations.
//!
//! [`BaseLoop`] knows nothing about threads. The host decides where its pump
//! runs; everything here only assumes it is driven from a tokio runtime.

#[cfg(unix)]
mod watch;

#[cfg(unix)]
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use loopbridge_core::LoopError;
use tokio::sync::{oneshot, watch as flag};
use tracing::{debug, error};

use crate::handle::{Handle, HandleError, HandleRef};
use crate::hooks::LoopHooks;
use crate::queue::DispatchQueue;

#[cfg(unix)]
pub(crate) use self::watch::WatchCallback;
#[cfg(unix)]
use self::watch::{Direction, Registry};

pub(crate) struct BaseLoop {
    queue: Arc<DispatchQueue>,
    /// `true` while no pump is running.
    stopped: flag::Sender<bool>,
    /// Bumped each time a pump is started.
    generation: Arc<AtomicU64>,
    closed: AtomicBool,
    epoch: Instant,
    hooks: Arc<dyn LoopHooks>,
    #[cfg(unix)]
    registry: Registry,
}

/// Marks the loop stopped however the pump exits.
struct StoppedGuard<'a>(&'a flag::Sender<bool>);

impl Drop for StoppedGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

impl BaseLoop {
    pub(crate) fn new(hooks: Arc<dyn LoopHooks>) -> Self {
        let (stopped, _) = flag::channel(true);
        Self {
            queue: Arc::new(DispatchQueue::new()),
            stopped,
            generation: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            epoch: Instant::now(),
            hooks,
            #[cfg(unix)]
            registry: Registry::default(),
        }
    }

    pub(crate) fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub(crate) fn hooks_name(&self) -> &str {
        self.hooks.name()
    }

    /// Monotonic seconds since the loop was created.
    pub(crate) fn time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub(crate) fn check_closed(&self) -> Result<(), LoopError> {
        if self.is_closed() {
            return Err(LoopError::IllegalState("event loop is closed".into()));
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse any further use. Returns `false` if already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Release what the loop still holds. The pump must not be running.
    pub(crate) fn release(&self) {
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!(dropped, "discarded queued handles on close");
        }
        #[cfg(unix)]
        self.registry.clear();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub(crate) async fn wait_stopped(&self) {
        let mut rx = self.stopped.subscribe();
        // The sender lives in `self`.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Flip from stopped to running. Returns the new pump generation, or
    /// `None` when a pump is already running.
    pub(crate) fn try_claim_start(&self) -> Option<u64> {
        let mut claimed = None;
        self.stopped.send_if_modified(|stopped| {
            if !*stopped {
                return false;
            }
            *stopped = false;
            claimed = Some(self.generation.fetch_add(1, Ordering::SeqCst) + 1);
            true
        });
        claimed
    }

    /// Queue a control handle that breaks the pump of the current generation.
    /// A kick that is only reached by a later pump does nothing.
    pub(crate) fn push_stop(&self, ack: Option<oneshot::Sender<()>>) -> HandleRef {
        let target = self.generation();
        let generation = Arc::clone(&self.generation);
        self.queue.push(Handle::control(move || {
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
            if generation.load(Ordering::SeqCst) != target {
                debug!(target, "ignoring stale stop request");
                return Ok(());
            }
            Err(HandleError::StopPump)
        }))
    }

    /// Stop the pump and wait until it has fully exited.
    pub(crate) async fn halt(&self) {
        while !self.is_stopped() {
            let target = self.generation();
            let (ack_tx, ack_rx) = oneshot::channel();
            let kick = self.push_stop(Some(ack_tx));
            tokio::select! {
                biased;
                _ = self.wait_stopped() => {
                    kick.cancel();
                    return;
                }
                _ = ack_rx => {}
            }
            if self.generation() == target {
                self.wait_stopped().await;
                return;
            }
        }
    }

    /// Startup hook, then arm registrations on this runtime.
    pub(crate) async fn main_loop_init(&self) -> Result<(), LoopError> {
        self.hooks.startup().await.map_err(LoopError::failed)?;
        #[cfg(unix)]
        self.registry.arm_all(&self.queue)?;
        Ok(())
    }

    /// The pump. Runs handles in queue order until a stop handle breaks it.
    ///
    /// Failures of ordinary callbacks are logged and the pump moves on. A
    /// failing control handle ends the pump with that error.
    pub(crate) async fn main_loop(&self, generation: u64) -> Result<(), LoopError> {
        let _stopped = StoppedGuard(&self.stopped);
        debug!(generation, "main loop running");

        loop {
            let Some(handle) = self.queue.pop().await else {
                return Ok(());
            };
            let id = handle.id();
            let control = handle.is_control();
            match handle.run() {
                Ok(()) => {}
                Err(HandleError::StopPump) => {
                    debug!(generation, "main loop stopped");
                    return Ok(());
                }
                Err(err) if control => {
                    error!(handle = id, error = %err, "control handle failed, stopping main loop");
                    return Err(err.into());
                }
                Err(err) => {
                    error!(handle = id, error = %err, "callback failed");
                }
            }
        }
    }

    /// Disarm registrations, then run the teardown hook.
    pub(crate) async fn main_loop_exit(&self) -> Result<(), LoopError> {
        #[cfg(unix)]
        self.registry.disarm_all();
        self.hooks.teardown().await.map_err(LoopError::failed)
    }
}

#[cfg(unix)]
impl BaseLoop {
    pub(crate) fn add_reader(&self, fd: RawFd, callback: WatchCallback) -> Result<(), LoopError> {
        self.registry.add_fd(Direction::Read, fd, callback, &self.queue)
    }

    pub(crate) fn remove_reader(&self, fd: RawFd) -> bool {
        self.registry.remove_fd(Direction::Read, fd)
    }

    pub(crate) fn has_reader(&self, fd: RawFd) -> bool {
        self.registry.has_fd(Direction::Read, fd)
    }

    pub(crate) fn add_writer(&self, fd: RawFd, callback: WatchCallback) -> Result<(), LoopError> {
        self.registry.add_fd(Direction::Write, fd, callback, &self.queue)
    }

    pub(crate) fn remove_writer(&self, fd: RawFd) -> bool {
        self.registry.remove_fd(Direction::Write, fd)
    }

    pub(crate) fn has_writer(&self, fd: RawFd) -> bool {
        self.registry.has_fd(Direction::Write, fd)
    }

    pub(crate) fn add_signal_handler(&self, signum: i32, callback: WatchCallback) -> Result<(), LoopError> {
        self.registry.add_signal(signum, callback, &self.queue)
    }

    pub(crate) fn remove_signal_handler(&self, signum: i32) -> bool {
        self.registry.remove_signal(signum)
    }

    pub(crate) fn has_signal_handler(&self, signum: i32) -> bool {
        self.registry.has_signal(signum)
    }
}

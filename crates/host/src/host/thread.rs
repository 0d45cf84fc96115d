use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError};
use std::thread;

use async_trait::async_trait;
use loopbridge_core::{LoopError, SharedError};
use tokio::runtime::Builder;
use tracing::{debug, error, info};

use super::core::{HostInner, HostPhase, LoopHost};
use crate::cancel::CancelToken;
use crate::current;
use crate::handle::panic_message;
use crate::job::{JobWorker, Supervisor, WorkerMode};
use crate::token::ReentryToken;

#[async_trait]
impl Supervisor for HostInner {
    async fn ensure_running(&self) -> Result<(), LoopError> {
        self.start_main_loop().map(|_| ())
    }
}

impl HostInner {
    /// Make sure the scheduler thread is running, spawning it if needed.
    /// Returns `true` when this call spawned it.
    pub(super) fn ensure_started(self: &Arc<Self>) -> Result<bool, LoopError> {
        let mut state = self.lock_state();
        loop {
            self.base.check_closed()?;
            match state.phase {
                HostPhase::Running => return Ok(false),
                HostPhase::Starting | HostPhase::Stopping => state = self.wait_phase(state),
                HostPhase::Closed => {
                    return Err(LoopError::IllegalState("event loop is closed".into()));
                }
                HostPhase::NotStarted => match state.thread.take() {
                    // A finished thread nobody joined yet.
                    Some(stale) => {
                        drop(state);
                        let _ = stale.join();
                        state = self.lock_state();
                    }
                    None => break,
                },
            }
        }

        if let Some(stale) = state.fatal.take() {
            debug!(error = %stale, "discarding unreported scheduler failure");
        }

        let stop_thread = CancelToken::new();
        let mut builder = thread::Builder::new().name(self.config.thread_name.clone());
        if let Some(size) = self.config.thread_stack_size {
            builder = builder.stack_size(size);
        }
        let host = Arc::clone(self);
        let thread_stop = stop_thread.clone();
        let handle = builder
            .spawn(move || thread_main(host, thread_stop))
            .map_err(|e| LoopError::StartupFailed(SharedError::new(e)))?;

        info!(thread = %self.config.thread_name, "starting scheduler thread");
        state.phase = HostPhase::Starting;
        state.stop_thread = Some(stop_thread);
        state.thread_id = Some(handle.thread().id());
        state.thread = Some(handle);
        self.notify_phase();

        while state.phase == HostPhase::Starting {
            state = self.wait_phase(state);
        }
        if state.phase == HostPhase::Running {
            return Ok(true);
        }

        let fatal = state.fatal.take();
        let thread = state.thread.take();
        drop(state);
        if let Some(thread) = thread {
            let _ = thread.join();
        }
        Err(match fatal {
            Some(err) => LoopError::StartupFailed(err),
            None => self.base.check_closed().err().unwrap_or(LoopError::LoopStopped),
        })
    }

    /// Ask the scheduler thread to exit and wait until it has.
    ///
    /// Returns the thread's failure if nobody has reported it yet.
    pub(super) fn shutdown_thread(&self) -> Result<(), LoopError> {
        let (thread, stop_thread) = {
            let mut state = self.lock_state();
            if state.on_scheduler_thread() {
                return Err(LoopError::IllegalState(
                    "the scheduler thread can't join itself".into(),
                ));
            }
            (state.thread.take(), state.stop_thread.clone())
        };

        if let Some(stop) = stop_thread {
            stop.cancel();
        }
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!(thread = %self.config.thread_name, "scheduler thread panicked outside its runtime");
            }
        }

        // Another caller may be joining the thread.
        let mut state = self.lock_state();
        while matches!(
            state.phase,
            HostPhase::Starting | HostPhase::Running | HostPhase::Stopping
        ) {
            state = self.wait_phase(state);
        }
        match state.fatal.take() {
            Some(err) => Err(LoopError::from_shared(err)),
            None => Ok(()),
        }
    }

    /// Start a pump on the scheduler unless one is running.
    /// Returns `true` when a new pump was started.
    pub(super) fn start_main_loop(&self) -> Result<bool, LoopError> {
        let (worker, stop_thread) = {
            let state = self.lock_state();
            let worker = state.worker.clone().ok_or(LoopError::LoopStopped)?;
            (worker, state.stop_thread.clone())
        };
        let Some(generation) = self.base.try_claim_start() else {
            return Ok(false);
        };

        // Jobs run plainly while the pump is up.
        let sync = worker.sync_scope();
        let base = Arc::clone(&self.base);
        let task = tokio::spawn(async move {
            let _sync = sync;
            let outcome = base.main_loop(generation).await;
            if outcome.is_err() {
                // A broken pump takes the thread down with it.
                if let Some(stop) = stop_thread {
                    stop.cancel();
                }
            }
            outcome
        });
        *self.main_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(true)
    }

    fn mark_running(&self) {
        let mut state = self.lock_state();
        if state.phase == HostPhase::Starting {
            state.phase = HostPhase::Running;
        }
        drop(state);
        self.notify_phase();
    }

    fn mark_stopping(&self) {
        let mut state = self.lock_state();
        if state.phase == HostPhase::Running {
            state.phase = HostPhase::Stopping;
        }
        drop(state);
        self.notify_phase();
    }

    fn finish_thread(&self, fatal: Option<SharedError>) {
        let mut state = self.lock_state();
        state.worker = None;
        state.thread_id = None;
        state.stop_thread = None;
        if let Some(err) = fatal {
            state.fatal.get_or_insert(err);
        }
        state.phase = if self.base.is_closed() {
            HostPhase::Closed
        } else {
            HostPhase::NotStarted
        };
        drop(state);
        self.notify_phase();
    }
}

/// Body of the scheduler thread.
///
/// A failure is logged and parked in the host's fatal slot rather than
/// re-raised here: startup waiters see it as `StartupFailed`, whoever joins
/// the thread gets it back from `close()` or the ephemeral teardown.
fn thread_main(inner: Arc<HostInner>, stop_thread: CancelToken) -> Result<(), SharedError> {
    let outcome = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => {
            let run = AssertUnwindSafe(|| runtime.block_on(scheduler_main(Arc::clone(&inner), stop_thread)));
            catch_unwind(run).unwrap_or_else(|panic| Err(LoopError::Panicked(panic_message(&*panic))))
        }
        Err(e) => Err(LoopError::Io(e)),
    };

    let outcome = outcome.map_err(LoopError::into_shared);
    match &outcome {
        Ok(()) => debug!(thread = %inner.config.thread_name, "scheduler thread exited"),
        Err(err) => error!(thread = %inner.config.thread_name, error = %err, "scheduler thread failed"),
    }
    inner.finish_thread(outcome.as_ref().err().cloned());
    outcome
}

/// Runs on the scheduler thread: bring the loop up, wait for the shutdown
/// request, then tear everything down again however startup went.
async fn scheduler_main(inner: Arc<HostInner>, stop_thread: CancelToken) -> Result<(), LoopError> {
    let base = Arc::clone(&inner.base);

    let worker_stop = CancelToken::new();
    let supervisor: Arc<dyn Supervisor> = inner.clone();
    let (worker, worker_task) = JobWorker::spawn(
        format!("{}-jobs", inner.config.thread_name),
        WorkerMode::Sync,
        supervisor,
        worker_stop.clone(),
    );

    let (token, drain) = ReentryToken::new();
    let relay_stop = CancelToken::new();
    let relay_task = tokio::spawn(drain.run(relay_stop.clone()));
    base.queue().install_token(token, thread::current().id());

    inner.lock_state().worker = Some(worker.clone());
    let _current = current::enter(LoopHost {
        inner: Arc::clone(&inner),
    });

    let startup = async {
        base.main_loop_init().await?;
        inner.start_main_loop()?;
        inner.mark_running();
        info!(
            thread = %inner.config.thread_name,
            hooks = base.hooks_name(),
            "scheduler thread running"
        );
        stop_thread.cancelled().await;
        Ok::<_, LoopError>(())
    }
    .await;
    inner.mark_stopping();
    debug!(thread = %inner.config.thread_name, "scheduler thread shutting down");

    worker.retire();
    inner.lock_state().worker = None;
    base.halt().await;

    let main_task = inner.main_task.lock().unwrap_or_else(PoisonError::into_inner).take();
    let pump = match main_task {
        Some(task) => task.await.unwrap_or_else(|e| Err(LoopError::Panicked(e.to_string()))),
        None => Ok(()),
    };
    let exit = base.main_loop_exit().await;

    worker_stop.cancel();
    let _ = worker_task.await;
    relay_stop.cancel();
    let _ = relay_task.await;
    base.queue().remove_token();

    startup.and(pump).and(exit)
}

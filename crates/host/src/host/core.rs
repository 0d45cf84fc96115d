#[cfg(unix)]
use std::os::unix::io::RawFd;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use loopbridge_core::{LoopConfig, LoopError, SharedError};
use tracing::{debug, info, warn};

use crate::base::BaseLoop;
#[cfg(unix)]
use crate::base::WatchCallback;
use crate::cancel::CancelToken;
use crate::future::{await_future, Awaitable};
use crate::handle::{Handle, HandleRef};
use crate::hooks::{LoopHooks, NoopHooks};
use crate::job::{JobOptions, JobWorker};

/// Lifecycle of the scheduler thread behind a [`LoopHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPhase {
    /// No scheduler thread.
    NotStarted,
    /// Thread spawned, startup not finished yet.
    Starting,
    /// Thread up and accepting jobs.
    Running,
    /// Thread asked to shut down.
    Stopping,
    /// Closed for good.
    Closed,
}

/// A legacy-style event loop whose work runs on a dedicated scheduler thread.
///
/// Cheap to clone; clones share the same loop. Blocking entry points
/// (`run_forever`, `run_until_complete`) may be called from any thread except
/// the scheduler thread itself, one at a time. The scheduler thread keeps the
/// host alive until [`LoopHost::close`] is called.
#[derive(Clone)]
pub struct LoopHost {
    pub(super) inner: Arc<HostInner>,
}

pub(super) struct HostInner {
    pub(super) config: LoopConfig,
    pub(super) base: Arc<BaseLoop>,
    state: Mutex<HostState>,
    phase_changed: Condvar,
    /// Task running the current (or last) pump.
    pub(super) main_task: Mutex<Option<tokio::task::JoinHandle<Result<(), LoopError>>>>,
}

pub(super) struct HostState {
    pub(super) phase: HostPhase,
    pub(super) thread: Option<thread::JoinHandle<Result<(), SharedError>>>,
    pub(super) thread_id: Option<ThreadId>,
    /// Present while the scheduler accepts jobs.
    pub(super) worker: Option<JobWorker>,
    pub(super) stop_thread: Option<CancelToken>,
    /// Id of the `run_forever`/`run_until_complete` in flight.
    pub(super) blocking_call: Option<u64>,
    next_call: u64,
    /// Blocking call whose job is waiting on the running pump.
    delegate: Option<u64>,
    /// Failure of the scheduler thread, reported once.
    pub(super) fatal: Option<SharedError>,
}

impl HostState {
    pub(super) fn on_scheduler_thread(&self) -> bool {
        self.thread_id == Some(thread::current().id())
    }
}

impl HostInner {
    pub(super) fn lock_state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn wait_phase<'a>(&self, state: MutexGuard<'a, HostState>) -> MutexGuard<'a, HostState> {
        self.phase_changed.wait(state).unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn notify_phase(&self) {
        self.phase_changed.notify_all();
    }

    fn worker(&self) -> Result<JobWorker, LoopError> {
        self.lock_state().worker.clone().ok_or(LoopError::LoopStopped)
    }

    fn enter_blocking(&self) -> Result<BlockingCall<'_>, LoopError> {
        let mut state = self.lock_state();
        self.base.check_closed()?;
        if state.on_scheduler_thread() || state.blocking_call.is_some() {
            return Err(LoopError::Reentrancy);
        }
        let id = state.next_call;
        state.next_call += 1;
        state.blocking_call = Some(id);
        Ok(BlockingCall { inner: self, id })
    }

    /// Called from a blocking call's job once it waits on the pump.
    fn attach_delegate(&self, call: u64) {
        let mut state = self.lock_state();
        if state.blocking_call == Some(call) {
            state.delegate = Some(call);
        }
    }

    /// Wait until blocking call `call` has returned to its caller.
    fn wait_call_returned(&self, call: u64) {
        let mut state = self.lock_state();
        while state.blocking_call == Some(call) {
            state = self.wait_phase(state);
        }
    }

    /// Tear down a thread this call started itself, keeping the first error.
    fn finish_ephemeral<T>(&self, ephemeral: bool, outcome: Result<T, LoopError>) -> Result<T, LoopError> {
        if !ephemeral {
            return outcome;
        }
        let shutdown = self.shutdown_thread();
        let value = outcome?;
        shutdown?;
        Ok(value)
    }
}

/// Clears the in-flight marker of a blocking entry point.
struct BlockingCall<'a> {
    inner: &'a HostInner,
    id: u64,
}

impl Drop for BlockingCall<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        if state.blocking_call == Some(self.id) {
            state.blocking_call = None;
            state.delegate = None;
        }
        drop(state);
        self.inner.notify_phase();
    }
}

impl LoopHost {
    /// Create a host with no lifecycle hooks. No thread is started yet.
    pub fn new(config: LoopConfig) -> Self {
        Self::with_hooks(config, Arc::new(NoopHooks))
    }

    pub fn with_hooks(config: LoopConfig, hooks: Arc<dyn LoopHooks>) -> Self {
        debug!(thread = %config.thread_name, hooks = hooks.name(), "creating loop host");
        let inner = HostInner {
            config,
            base: Arc::new(BaseLoop::new(hooks)),
            state: Mutex::new(HostState {
                phase: HostPhase::NotStarted,
                thread: None,
                thread_id: None,
                worker: None,
                stop_thread: None,
                blocking_call: None,
                next_call: 0,
                delegate: None,
                fatal: None,
            }),
            phase_changed: Condvar::new(),
            main_task: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    /// Start the scheduler thread and keep it up until [`LoopHost::close`].
    pub fn start(&self) -> Result<(), LoopError> {
        if !self.inner.ensure_started()? {
            return Err(LoopError::IllegalState("this loop is already running".into()));
        }
        Ok(())
    }

    /// Run the main loop until [`LoopHost::stop`] is called.
    pub fn run_forever(&self) -> Result<(), LoopError> {
        let inner = &self.inner;
        let blocking = inner.enter_blocking()?;
        let ephemeral = inner.ensure_started()?;

        let outcome = inner.worker().and_then(|worker| {
            let host = Arc::clone(inner);
            let call = blocking.id;
            worker.call(JobOptions::supervised("run_forever"), move || {
                host.attach_delegate(call);
                async move {
                    host.base.wait_stopped().await;
                    Ok(())
                }
            })
        });
        inner.finish_ephemeral(ephemeral, outcome)
    }

    /// Run until `awaitable` completes and return its outcome.
    ///
    /// Fails with [`LoopError::LoopStopped`] if the loop is stopped first. The
    /// main loop is stopped again before this returns.
    pub fn run_until_complete<T>(&self, awaitable: impl Into<Awaitable<T>>) -> Result<T, LoopError>
    where
        T: Clone + Send + 'static,
    {
        let inner = &self.inner;
        let blocking = inner.enter_blocking()?;
        let ephemeral = inner.ensure_started()?;
        let awaitable = awaitable.into();

        let outcome = inner.worker().and_then(|worker| {
            let host = Arc::clone(inner);
            let call = blocking.id;
            let outcome = worker.call(JobOptions::supervised("run_until_complete"), move || {
                host.attach_delegate(call);
                run_coroutine(Arc::clone(&host.base), awaitable)
            });

            let base = Arc::clone(&inner.base);
            let halted = worker.call(JobOptions::no_start("stop_wait"), move || async move {
                base.halt().await;
                Ok(())
            });
            if let Err(err) = halted {
                debug!(error = %err, "main loop was already gone after run_until_complete");
            }
            outcome
        });
        inner.finish_ephemeral(ephemeral, outcome)
    }

    /// Halt the main loop.
    ///
    /// From another thread this blocks until the loop has stopped and a
    /// `run_forever`/`run_until_complete` that was waiting on it has returned.
    /// On the scheduler thread it only queues the stop. Does nothing when the
    /// loop is not running. The non-blocking stop used at teardown is internal.
    pub fn stop(&self) -> Result<(), LoopError> {
        let inner = &self.inner;
        let (on_thread, worker, delegate) = {
            let state = inner.lock_state();
            if state.phase != HostPhase::Running {
                return Ok(());
            }
            (state.on_scheduler_thread(), state.worker.clone(), state.delegate)
        };
        if inner.base.is_stopped() {
            return Ok(());
        }

        if on_thread {
            inner.base.push_stop(None);
            return Ok(());
        }
        let Some(worker) = worker else {
            return Ok(());
        };
        let base = Arc::clone(&inner.base);
        match worker.call(JobOptions::no_start("stop"), move || async move {
            base.halt().await;
            Ok(())
        }) {
            Ok(()) | Err(LoopError::LoopStopped) => {}
            Err(err) => return Err(err),
        }
        if let Some(call) = delegate {
            inner.wait_call_returned(call);
        }
        Ok(())
    }

    /// Shut the scheduler thread down and release the loop. Irreversible.
    ///
    /// Fails when called from the scheduler thread, or while a blocking entry
    /// point is in flight. A scheduler failure nobody saw yet is returned
    /// after the host is closed.
    pub fn close(&self) -> Result<(), LoopError> {
        let inner = &self.inner;
        {
            let state = inner.lock_state();
            if state.on_scheduler_thread() {
                return Err(LoopError::IllegalState(
                    "you can't close a loop from its own scheduler thread".into(),
                ));
            }
            if state.blocking_call.is_some() {
                return Err(LoopError::IllegalState(
                    "can't close a loop while run_forever()/run_until_complete() is in progress".into(),
                ));
            }
            if !inner.base.mark_closed() {
                return Ok(());
            }
        }

        let shutdown = inner.shutdown_thread();
        inner.base.release();
        inner.lock_state().phase = HostPhase::Closed;
        inner.notify_phase();
        info!(thread = %inner.config.thread_name, "loop host closed");
        shutdown
    }

    pub fn phase(&self) -> HostPhase {
        self.inner.lock_state().phase
    }

    /// Whether the scheduler thread is up and accepting work.
    pub fn is_running(&self) -> bool {
        self.phase() == HostPhase::Running
    }

    pub fn is_closed(&self) -> bool {
        self.inner.base.is_closed()
    }

    /// Monotonic seconds since the host was created. Does not start the thread.
    pub fn time(&self) -> f64 {
        self.inner.base.time()
    }

    /// Queue `callback` for the pump. Callable from any thread.
    pub fn call_soon(&self, callback: impl FnOnce() + Send + 'static) -> Result<HandleRef, LoopError> {
        self.queue_handle(Handle::new(callback))
    }

    /// Queue a prepared handle for the pump.
    pub fn queue_handle(&self, handle: Handle) -> Result<HandleRef, LoopError> {
        self.inner.base.check_closed()?;
        Ok(self.inner.base.queue().push(handle))
    }

    /// Apply `op` to the base loop on the thread that owns it.
    ///
    /// Without a scheduler thread, or on it, `op` runs right here. Otherwise
    /// it is sent over as a supervised job bounded by the registration timeout.
    #[cfg(unix)]
    fn route<T, F>(&self, name: &'static str, op: F) -> Result<T, LoopError>
    where
        T: Send + 'static,
        F: FnOnce(&BaseLoop) -> Result<T, LoopError> + Send + 'static,
    {
        let inner = &self.inner;
        inner.base.check_closed()?;
        let worker = {
            let state = inner.lock_state();
            if state.thread_id.is_none() || state.on_scheduler_thread() {
                None
            } else {
                state.worker.clone()
            }
        };

        match worker {
            None => op(&inner.base),
            Some(worker) => {
                let base = Arc::clone(&inner.base);
                let options = JobOptions::supervised(name).timeout(inner.config.registration_timeout());
                worker.call(options, move || async move { op(&base) })
            }
        }
    }
}

#[cfg(unix)]
impl LoopHost {
    /// Call `callback` on the scheduler thread whenever `fd` is readable.
    /// The descriptor must stay open while registered.
    pub fn add_reader(&self, fd: RawFd, callback: impl Fn() + Send + Sync + 'static) -> Result<(), LoopError> {
        let callback: WatchCallback = Arc::new(callback);
        self.route("add_reader", move |base| base.add_reader(fd, callback))
    }

    /// Returns whether a reader was registered for `fd`.
    pub fn remove_reader(&self, fd: RawFd) -> Result<bool, LoopError> {
        self.route("remove_reader", move |base| Ok(base.remove_reader(fd)))
    }

    pub fn has_reader(&self, fd: RawFd) -> bool {
        self.inner.base.has_reader(fd)
    }

    /// Call `callback` on the scheduler thread whenever `fd` is writable.
    pub fn add_writer(&self, fd: RawFd, callback: impl Fn() + Send + Sync + 'static) -> Result<(), LoopError> {
        let callback: WatchCallback = Arc::new(callback);
        self.route("add_writer", move |base| base.add_writer(fd, callback))
    }

    pub fn remove_writer(&self, fd: RawFd) -> Result<bool, LoopError> {
        self.route("remove_writer", move |base| Ok(base.remove_writer(fd)))
    }

    pub fn has_writer(&self, fd: RawFd) -> bool {
        self.inner.base.has_writer(fd)
    }

    /// Call `callback` on the scheduler thread whenever `signum` is delivered.
    pub fn add_signal_handler(
        &self,
        signum: i32,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), LoopError> {
        let callback: WatchCallback = Arc::new(callback);
        self.route("add_signal_handler", move |base| base.add_signal_handler(signum, callback))
    }

    pub fn remove_signal_handler(&self, signum: i32) -> Result<bool, LoopError> {
        self.route("remove_signal_handler", move |base| Ok(base.remove_signal_handler(signum)))
    }

    pub fn has_signal_handler(&self, signum: i32) -> bool {
        self.inner.base.has_signal_handler(signum)
    }
}

impl fmt::Debug for LoopHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHost")
            .field("thread", &self.inner.config.thread_name)
            .field("phase", &self.phase())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drive `awaitable` to completion on the scheduler, giving up with
/// [`LoopError::LoopStopped`] once the main loop stops. A coroutine that
/// loses that race is cancelled.
async fn run_coroutine<T>(base: Arc<BaseLoop>, awaitable: Awaitable<T>) -> Result<T, LoopError>
where
    T: Clone + Send + 'static,
{
    let spawned = matches!(awaitable, Awaitable::Coroutine(_));
    let future = awaitable.ensure_future();
    let scope = CancelToken::new();
    tokio::select! {
        biased;
        outcome = await_future(&future, &scope) => outcome,
        _ = base.wait_stopped() => {
            warn!("event loop stopped before the future completed");
            if spawned {
                future.cancel();
            }
            Err(LoopError::LoopStopped)
        }
    }
}

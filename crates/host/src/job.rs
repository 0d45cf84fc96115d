//! Job submission into the scheduler thread.
//!
//! A [`JobWorker`] lives on the scheduler and runs jobs submitted from any
//! thread. Each job's outcome goes back to whoever submitted it through a
//! [`JobTicket`]; a failing or panicking job never takes the worker down.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use loopbridge_core::LoopError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::cancel::CancelToken;
use crate::handle::panic_message;

// ── Modes ────────────────────────────────────────────────────────────

/// Execution mode of a [`JobWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Not accepting jobs (not started yet, or retired).
    Idle,
    /// The main loop is up; jobs run as they are.
    Sync,
    /// The main loop may be down; supervised jobs restart it first.
    Supervised,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// May restart the main loop before running.
    Supervised,
    /// Runs as-is even when the main loop is stopped.
    NoStart,
}

/// Whatever owns the main loop a supervised job depends on.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Start the main loop if it is stopped; resolve once it is running.
    async fn ensure_running(&self) -> Result<(), LoopError>;
}

// ── Jobs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub name: &'static str,
    pub kind: JobKind,
    pub timeout: Option<Duration>,
}

impl JobOptions {
    pub fn supervised(name: &'static str) -> Self {
        Self {
            name,
            kind: JobKind::Supervised,
            timeout: None,
        }
    }

    pub fn no_start(name: &'static str) -> Self {
        Self {
            name,
            kind: JobKind::NoStart,
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

trait ErasedJob: Send {
    fn execute(self: Box<Self>, timeout: Option<Duration>) -> BoxFuture<'static, ()>;
    fn fail(self: Box<Self>, err: LoopError);
}

struct TypedJob<F, T> {
    make: F,
    reply: oneshot::Sender<Result<T, LoopError>>,
}

impl<F, Fut, T> ErasedJob for TypedJob<F, T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, LoopError>> + Send + 'static,
    T: Send + 'static,
{
    fn execute(self: Box<Self>, timeout: Option<Duration>) -> BoxFuture<'static, ()> {
        let TypedJob { make, reply } = *self;
        async move {
            let outcome = guarded(make(), timeout).await;
            // The submitter may have stopped listening.
            let _ = reply.send(outcome);
        }
        .boxed()
    }

    fn fail(self: Box<Self>, err: LoopError) {
        let _ = self.reply.send(Err(err));
    }
}

async fn guarded<Fut, T>(fut: Fut, timeout: Option<Duration>) -> Result<T, LoopError>
where
    Fut: Future<Output = Result<T, LoopError>>,
{
    let caught = AssertUnwindSafe(fut).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, caught).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(LoopError::Timeout(limit)),
        },
        None => caught.await,
    };
    outcome.unwrap_or_else(|panic| Err(LoopError::Panicked(panic_message(&*panic))))
}

/// A unit of work for a [`JobWorker`]. Runs at most once.
pub struct Job {
    options: JobOptions,
    body: Box<dyn ErasedJob>,
}

impl Job {
    pub fn new<F, Fut, T>(options: JobOptions, make: F) -> (Job, JobTicket<T>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, LoopError>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            options,
            body: Box::new(TypedJob { make, reply }),
        };
        (job, JobTicket { rx })
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    fn fail(self, err: LoopError) {
        self.body.fail(err);
    }
}

/// The submitter's end of a job.
#[must_use = "dropping a ticket discards the job's outcome"]
pub struct JobTicket<T> {
    rx: oneshot::Receiver<Result<T, LoopError>>,
}

impl<T> JobTicket<T> {
    /// Wait from async code.
    pub async fn wait(self) -> Result<T, LoopError> {
        // A dropped reply means the worker went away with the job.
        self.rx.await.unwrap_or(Err(LoopError::LoopStopped))
    }

    /// Block the calling OS thread until the job finishes.
    pub fn wait_blocking(self) -> Result<T, LoopError> {
        futures::executor::block_on(self.wait())
    }
}

// ── Worker ───────────────────────────────────────────────────────────

struct Shared {
    name: String,
    tx: mpsc::UnboundedSender<Job>,
    mode: Mutex<WorkerMode>,
}

/// Cloneable handle to a job worker running on the scheduler.
#[derive(Clone)]
pub struct JobWorker {
    shared: Arc<Shared>,
}

impl JobWorker {
    /// Start serving jobs on the current runtime until `shutdown` fires.
    pub fn spawn(
        name: impl Into<String>,
        mode: WorkerMode,
        supervisor: Arc<dyn Supervisor>,
        shutdown: CancelToken,
    ) -> (JobWorker, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name: name.into(),
            tx,
            mode: Mutex::new(mode),
        });
        let worker = JobWorker { shared };
        let task = tokio::spawn(worker.clone().serve(rx, supervisor, shutdown));
        (worker, task)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn mode(&self) -> WorkerMode {
        *self.shared.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switch to [`WorkerMode::Sync`]. Ignored once idle.
    pub fn sync_on(&self) -> bool {
        self.transition(WorkerMode::Sync)
    }

    /// Switch to [`WorkerMode::Supervised`]. Ignored once idle.
    pub fn sync_off(&self) -> bool {
        self.transition(WorkerMode::Supervised)
    }

    /// Stop restarting the main loop for good.
    pub fn retire(&self) {
        *self.shared.mode.lock().unwrap_or_else(PoisonError::into_inner) = WorkerMode::Idle;
    }

    /// Enter sync mode until the returned guard drops.
    pub fn sync_scope(&self) -> SyncScope {
        self.sync_on();
        SyncScope {
            worker: self.clone(),
        }
    }

    fn transition(&self, to: WorkerMode) -> bool {
        let mut mode = self.shared.mode.lock().unwrap_or_else(PoisonError::into_inner);
        if *mode == WorkerMode::Idle {
            debug!(worker = %self.shared.name, to = ?to, "ignoring mode change on idle worker");
            return false;
        }
        *mode = to;
        true
    }

    /// Hand a job to the worker. Safe from any thread.
    pub fn submit(&self, job: Job) -> Result<(), LoopError> {
        self.shared.tx.send(job).map_err(|mpsc::error::SendError(job)| {
            job.fail(LoopError::LoopStopped);
            LoopError::LoopStopped
        })
    }

    /// Submit and return the ticket without waiting.
    pub fn run_soon<F, Fut, T>(&self, options: JobOptions, make: F) -> Result<JobTicket<T>, LoopError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, LoopError>> + Send + 'static,
        T: Send + 'static,
    {
        let (job, ticket) = Job::new(options, make);
        self.submit(job)?;
        Ok(ticket)
    }

    /// Submit, await completion, and return the job's outcome.
    pub async fn run<F, Fut, T>(&self, options: JobOptions, make: F) -> Result<T, LoopError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, LoopError>> + Send + 'static,
        T: Send + 'static,
    {
        self.run_soon(options, make)?.wait().await
    }

    /// Submit and block the calling thread until the job finishes.
    pub fn call<F, Fut, T>(&self, options: JobOptions, make: F) -> Result<T, LoopError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, LoopError>> + Send + 'static,
        T: Send + 'static,
    {
        self.run_soon(options, make)?.wait_blocking()
    }

    async fn serve(
        self,
        mut rx: mpsc::UnboundedReceiver<Job>,
        supervisor: Arc<dyn Supervisor>,
        shutdown: CancelToken,
    ) {
        let mut running = JoinSet::new();
        debug!(worker = %self.shared.name, "job worker started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => {
                        let worker = self.clone();
                        let supervisor = Arc::clone(&supervisor);
                        running.spawn(async move { worker.run_job(job, &*supervisor).await });
                    }
                    None => break,
                },
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(worker = %self.shared.name, error = %e, "job task panicked");
                        }
                    }
                }
            }
        }

        self.retire();
        rx.close();
        while let Ok(job) = rx.try_recv() {
            warn!(worker = %self.shared.name, job = job.options.name, "dropping job submitted during shutdown");
            job.fail(LoopError::LoopStopped);
        }
        running.shutdown().await;
        debug!(worker = %self.shared.name, "job worker stopped");
    }

    async fn run_job(&self, job: Job, supervisor: &dyn Supervisor) {
        let Job { options, body } = job;
        if options.kind == JobKind::Supervised && self.mode() == WorkerMode::Supervised {
            if let Err(err) = supervisor.ensure_running().await {
                warn!(job = options.name, error = %err, "could not restart main loop for job");
                body.fail(err);
                return;
            }
        }

        debug!(job = options.name, "running job");
        body.execute(options.timeout).await;
    }
}

/// Restores [`WorkerMode::Supervised`] when dropped.
pub struct SyncScope {
    worker: JobWorker,
}

impl Drop for SyncScope {
    fn drop(&mut self) {
        self.worker.sync_off();
    }
}

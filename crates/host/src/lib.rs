mod base;
pub mod cancel;
pub mod current;
pub mod future;
pub mod handle;
pub mod hooks;
pub mod host;
pub mod job;
pub mod queue;
pub mod token;

pub use cancel::CancelToken;
pub use current::current_loop;
pub use future::{await_future, spawn_task, Awaitable, CallbackId, LegacyFuture};
pub use handle::{Handle, HandleError, HandleRef};
pub use hooks::{LoopHooks, NoopHooks};
pub use host::{HostPhase, LoopHost};
pub use job::{Job, JobKind, JobOptions, JobTicket, JobWorker, Supervisor, SyncScope, WorkerMode};
pub use queue::DispatchQueue;
pub use token::{ReentryDrain, ReentryToken};

pub use loopbridge_core::{load_dotenv, BoxError, CancelOrigin, LoopConfig, LoopError, SharedError};

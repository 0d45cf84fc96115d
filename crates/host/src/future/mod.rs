//! Legacy-style futures and the bridge that lets scheduler tasks await them.
//!
//! - `legacy`: the callback-based [`LegacyFuture`]
//! - `bridge`: [`await_future`], with cancellation forwarded both ways
//! - `task`: wrapping coroutines into legacy futures

mod bridge;
mod legacy;
mod task;

pub use self::bridge::await_future;
pub use self::legacy::{CallbackId, LegacyFuture};
pub use self::task::{spawn_task, Awaitable};

//! Loop host -- owns the scheduler thread and bridges blocking callers into it.
//!
//! Split into focused submodules:
//! - `core`: LoopHost struct, constructors, and the caller-facing API
//! - `thread`: scheduler thread startup, supervision, and teardown

mod core;
mod thread;
#[cfg(test)]
mod tests;

pub use self::core::{HostPhase, LoopHost};

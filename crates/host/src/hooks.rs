use async_trait::async_trait;
use loopbridge_core::BoxError;

/// Startup and teardown hooks run on the scheduler thread around each
/// lifetime of the worker thread.
///
/// `startup` runs before the main loop is started; an error there is fatal to
/// the thread and surfaces as a startup failure. `teardown` runs after the main
/// loop has fully stopped, even when startup failed.
#[async_trait]
pub trait LoopHooks: Send + Sync {
    async fn startup(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn teardown(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Human-readable name used in logs.
    fn name(&self) -> &str;
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl LoopHooks for NoopHooks {
    fn name(&self) -> &str {
        "noop"
    }
}

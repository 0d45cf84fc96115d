use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error used at the edges where callers hand us their own failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which side asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrigin {
    /// The legacy future was cancelled on its own.
    Legacy,
    /// A structured-scheduler scope requested the cancellation.
    Scope,
}

impl fmt::Display for CancelOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelOrigin::Legacy => f.write_str("legacy"),
            CancelOrigin::Scope => f.write_str("scope"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("you can't nest calls to run_until_complete()/run_forever()")]
    Reentrancy,

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("could not start the scheduler thread: {0}")]
    StartupFailed(#[source] SharedError),

    #[error("event loop stopped before the future completed")]
    LoopStopped,

    #[error("operation cancelled ({origin})")]
    Cancelled {
        origin: CancelOrigin,
        #[source]
        cause: Option<Box<LoopError>>,
    },

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Failed(SharedError),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoopError {
    /// Wrap a caller-provided failure so it displays unchanged.
    pub fn failed(err: impl Into<BoxError>) -> Self {
        LoopError::Failed(SharedError::from_box(err.into()))
    }

    /// A cancellation that originated on the legacy side.
    pub fn legacy_cancelled() -> Self {
        LoopError::Cancelled {
            origin: CancelOrigin::Legacy,
            cause: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoopError::Cancelled { .. })
    }

    /// Convert into a cloneable form, unwrapping an existing `Failed`.
    pub fn into_shared(self) -> SharedError {
        match self {
            LoopError::Failed(shared) => shared,
            other => SharedError::new(other),
        }
    }

    /// Inverse of [`into_shared`](Self::into_shared): a shared `LoopError`
    /// comes back as the same variant, anything else as `Failed`.
    pub fn from_shared(shared: SharedError) -> Self {
        match shared.downcast_ref::<LoopError>() {
            Some(err) => err.duplicate().unwrap_or(LoopError::Failed(shared)),
            None => LoopError::Failed(shared),
        }
    }

    /// Rebuild the same variant. `None` for a TOML parse error.
    fn duplicate(&self) -> Option<Self> {
        Some(match self {
            LoopError::Reentrancy => LoopError::Reentrancy,
            LoopError::IllegalState(msg) => LoopError::IllegalState(msg.clone()),
            LoopError::StartupFailed(cause) => LoopError::StartupFailed(cause.clone()),
            LoopError::LoopStopped => LoopError::LoopStopped,
            LoopError::Cancelled { origin, cause } => LoopError::Cancelled {
                origin: *origin,
                cause: match cause {
                    Some(cause) => Some(Box::new(cause.duplicate()?)),
                    None => None,
                },
            },
            LoopError::Timeout(limit) => LoopError::Timeout(*limit),
            LoopError::Panicked(msg) => LoopError::Panicked(msg.clone()),
            LoopError::Failed(shared) => LoopError::Failed(shared.clone()),
            LoopError::Config(msg) => LoopError::Config(msg.clone()),
            LoopError::Io(err) => LoopError::Io(std::io::Error::new(err.kind(), err.to_string())),
            LoopError::ConfigParse(_) => return None,
        })
    }
}

/// A failure that several readers may observe.
///
/// Display and `source()` forward to the wrapped error, so wrapping does not
/// change what the caller sees.
#[derive(Debug, Clone)]
pub struct SharedError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl SharedError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        SharedError(Arc::new(err))
    }

    pub fn from_box(err: BoxError) -> Self {
        SharedError(Arc::from(err))
    }

    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }

    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LoopError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

// ── Loop host config ─────────────────────────────────────────────────

/// Settings for a loop host and its scheduler thread.
///
/// Parsed from TOML with support for environment variable overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Name given to the dedicated scheduler thread.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,

    /// Stack size for the scheduler thread (platform default when unset).
    #[serde(default)]
    pub thread_stack_size: Option<usize>,

    /// Timeout for reader/writer/signal registrations marshalled onto the
    /// scheduler thread.
    #[serde(default = "default_registration_timeout_secs")]
    pub registration_timeout_secs: u64,
}

fn default_thread_name() -> String {
    "loopbridge-scheduler".into()
}

fn default_registration_timeout_secs() -> u64 {
    999
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
            thread_stack_size: None,
            registration_timeout_secs: default_registration_timeout_secs(),
        }
    }
}

impl LoopConfig {
    /// Parse from a TOML string. Env overrides are not applied.
    pub fn from_toml(toml_str: &str) -> Result<Self, LoopError> {
        let config: LoopConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LoopError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: LoopConfig = toml::from_str(&content)?;
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, LoopError> {
        let mut config = LoopConfig::default();
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    /// Apply overrides from a key lookup (the process environment in practice).
    ///
    /// Supported keys:
    /// - `LOOPBRIDGE_THREAD_NAME`
    /// - `LOOPBRIDGE_THREAD_STACK_SIZE`
    /// - `LOOPBRIDGE_REGISTRATION_TIMEOUT_SECS`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("LOOPBRIDGE_THREAD_NAME").filter(|v| !v.is_empty()) {
            self.thread_name = v;
        }
        if let Some(v) = lookup("LOOPBRIDGE_THREAD_STACK_SIZE") {
            match v.parse() {
                Ok(size) => self.thread_stack_size = Some(size),
                Err(_) => tracing::warn!(value = %v, "ignoring invalid LOOPBRIDGE_THREAD_STACK_SIZE"),
            }
        }
        if let Some(v) = lookup("LOOPBRIDGE_REGISTRATION_TIMEOUT_SECS") {
            match v.parse() {
                Ok(secs) => self.registration_timeout_secs = secs,
                Err(_) => {
                    tracing::warn!(value = %v, "ignoring invalid LOOPBRIDGE_REGISTRATION_TIMEOUT_SECS")
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), LoopError> {
        if self.thread_name.trim().is_empty() {
            return Err(LoopError::Config("thread_name must not be empty".into()));
        }
        if self.registration_timeout_secs == 0 {
            return Err(LoopError::Config(
                "registration_timeout_secs must be positive".into(),
            ));
        }
        if self.thread_stack_size == Some(0) {
            return Err(LoopError::Config("thread_stack_size must be positive".into()));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!(
            thread_name = %self.thread_name,
            stack_size = ?self.thread_stack_size,
            registration_timeout_secs = self.registration_timeout_secs,
            "loop config loaded"
        );
    }
}

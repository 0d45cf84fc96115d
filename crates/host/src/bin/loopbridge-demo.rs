//! loopbridge-demo: drives a loop host from plain threads.
//!
//! Starts a host, feeds callbacks into it from a producer thread, runs a
//! coroutine to completion from the main thread, then stops and closes.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (config from LOOPBRIDGE_* env vars)
//! loopbridge-demo
//!
//! # Config file, more callbacks
//! loopbridge-demo --config config/loopbridge.toml --callbacks 100
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use loopbridge_host::{current_loop, load_dotenv, Awaitable, LoopConfig, LoopError, LoopHost};

/// Runs legacy-style callbacks and a coroutine on a dedicated scheduler thread.
#[derive(Parser, Debug)]
#[command(name = "loopbridge-demo", version, about)]
struct Cli {
    /// Path to a TOML config file (env overrides still apply).
    #[arg(long, env = "LOOPBRIDGE_CONFIG")]
    config: Option<String>,

    /// Number of callbacks the producer thread queues.
    #[arg(long, default_value_t = 10)]
    callbacks: usize,

    /// Milliseconds the demo coroutine sleeps before answering.
    #[arg(long, default_value_t = 50)]
    delay_ms: u64,
}

fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => LoopConfig::from_file(path).with_context(|| format!("loading {path}"))?,
        None => LoopConfig::from_env()?,
    };
    config.log_summary();

    let host = LoopHost::new(config);
    host.start()?;

    let ran = Arc::new(AtomicUsize::new(0));
    let producer = {
        let host = host.clone();
        let ran = ran.clone();
        let count = cli.callbacks;
        thread::spawn(move || -> Result<(), LoopError> {
            for i in 0..count {
                let ran = ran.clone();
                host.call_soon(move || {
                    let on_loop = current_loop().is_some();
                    ran.fetch_add(1, Ordering::SeqCst);
                    info!(callback = i, on_loop, "callback ran");
                })?;
            }
            Ok(())
        })
    };
    producer
        .join()
        .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;

    let delay = Duration::from_millis(cli.delay_ms);
    let answer = host.run_until_complete(Awaitable::coroutine(async move {
        tokio::time::sleep(delay).await;
        Ok::<_, LoopError>(42)
    }))?;
    info!(answer, callbacks = ran.load(Ordering::SeqCst), "coroutine finished");

    host.stop()?;
    host.close()?;
    info!(elapsed_secs = host.time(), "demo done");
    Ok(())
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loopbridge_core::{BoxError, LoopConfig, LoopError};

use super::{HostPhase, LoopHost};
use crate::current::current_loop;
use crate::future::{Awaitable, LegacyFuture};
use crate::hooks::LoopHooks;

const WAIT: Duration = Duration::from_secs(5);

fn test_config(name: &str) -> LoopConfig {
    LoopConfig {
        thread_name: name.into(),
        ..LoopConfig::default()
    }
}

#[derive(Default)]
struct CountingHooks {
    startups: AtomicUsize,
    teardowns: AtomicUsize,
}

#[async_trait]
impl LoopHooks for CountingHooks {
    async fn startup(&self) -> Result<(), BoxError> {
        self.startups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn teardown(&self) -> Result<(), BoxError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

struct BrokenTeardown;

#[async_trait]
impl LoopHooks for BrokenTeardown {
    async fn teardown(&self) -> Result<(), BoxError> {
        Err("teardown exploded".into())
    }

    fn name(&self) -> &str {
        "broken-teardown"
    }
}

#[test]
fn new_host_is_idle() {
    let host = LoopHost::new(test_config("idle-host"));
    assert_eq!(host.phase(), HostPhase::NotStarted);
    assert!(!host.is_running());
    assert!(!host.is_closed());
    assert!(host.time() >= 0.0);
    // Reading the clock does not spin up a thread.
    assert_eq!(host.phase(), HostPhase::NotStarted);
    host.close().unwrap();
    assert_eq!(host.phase(), HostPhase::Closed);
}

#[test]
fn start_runs_hooks_and_close_tears_down() {
    let hooks = Arc::new(CountingHooks::default());
    let host = LoopHost::with_hooks(test_config("hooked-host"), hooks.clone());

    host.start().unwrap();
    assert_eq!(host.phase(), HostPhase::Running);
    assert_eq!(hooks.startups.load(Ordering::SeqCst), 1);
    assert!(matches!(host.start(), Err(LoopError::IllegalState(_))));

    host.close().unwrap();
    assert_eq!(host.phase(), HostPhase::Closed);
    assert_eq!(hooks.teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn close_is_idempotent_and_final() {
    let host = LoopHost::new(test_config("closing-host"));
    host.start().unwrap();
    host.close().unwrap();
    host.close().unwrap();

    assert!(host.is_closed());
    assert!(matches!(host.start(), Err(LoopError::IllegalState(_))));
    assert!(matches!(host.run_forever(), Err(LoopError::IllegalState(_))));
    assert!(matches!(host.call_soon(|| {}), Err(LoopError::IllegalState(_))));
}

#[test]
fn stop_on_idle_host_is_a_no_op() {
    let host = LoopHost::new(test_config("stop-idle"));
    host.stop().unwrap();
    assert_eq!(host.phase(), HostPhase::NotStarted);
    host.close().unwrap();
}

#[test]
fn callbacks_queued_before_start_run_after_start() {
    let host = LoopHost::new(test_config("early-callbacks"));
    let (tx, rx) = mpsc::channel();
    for i in 0..3 {
        let tx = tx.clone();
        host.call_soon(move || tx.send(i).unwrap()).unwrap();
    }
    host.start().unwrap();
    let seen: Vec<i32> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(seen, vec![0, 1, 2]);
    host.close().unwrap();
}

#[test]
fn callbacks_see_their_host_as_current() {
    let host = LoopHost::new(test_config("current-host"));
    host.start().unwrap();
    assert!(current_loop().is_none());

    let (tx, rx) = mpsc::channel();
    host.call_soon(move || {
        let current = current_loop().map(|h| h.config().thread_name.clone());
        tx.send(current).unwrap();
    })
    .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap().as_deref(), Some("current-host"));
    host.close().unwrap();
}

#[test]
fn ephemeral_run_leaves_host_not_started() {
    let hooks = Arc::new(CountingHooks::default());
    let host = LoopHost::with_hooks(test_config("ephemeral"), hooks.clone());

    let value = host
        .run_until_complete(Awaitable::coroutine(async { Ok::<_, LoopError>(42) }))
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(host.phase(), HostPhase::NotStarted);

    let value = host
        .run_until_complete(Awaitable::coroutine(async { Ok::<_, LoopError>(43) }))
        .unwrap();
    assert_eq!(value, 43);
    assert_eq!(hooks.startups.load(Ordering::SeqCst), 2);
    assert_eq!(hooks.teardowns.load(Ordering::SeqCst), 2);
    host.close().unwrap();
}

#[test]
fn started_host_stays_up_across_runs() {
    let host = LoopHost::new(test_config("persistent"));
    host.start().unwrap();

    let done = LegacyFuture::new();
    done.set_result("ready").unwrap();
    assert_eq!(host.run_until_complete(done).unwrap(), "ready");
    assert_eq!(host.phase(), HostPhase::Running);

    // The main loop was stopped after the run; a new run restarts it.
    let value = host
        .run_until_complete(Awaitable::coroutine(async { Ok::<_, LoopError>(7u8) }))
        .unwrap();
    assert_eq!(value, 7);
    host.close().unwrap();
}

#[test]
fn failure_of_the_future_is_returned_unchanged() {
    let host = LoopHost::new(test_config("failing-future"));
    let err = host
        .run_until_complete(Awaitable::coroutine(async {
            Err::<u8, _>(LoopError::failed("coroutine failed"))
        }))
        .unwrap_err();
    assert_eq!(err.to_string(), "coroutine failed");
    host.close().unwrap();
}

#[test]
fn typed_failures_keep_their_variant() {
    let host = LoopHost::new(test_config("typed-failure"));
    host.start().unwrap();

    let limit = Duration::from_secs(1);
    match host.run_until_complete(Awaitable::coroutine(async move {
        Err::<u8, _>(LoopError::Timeout(limit))
    })) {
        Err(LoopError::Timeout(got)) => assert_eq!(got, limit),
        other => panic!("expected Timeout, got {other:?}"),
    }

    let failed = LegacyFuture::<u8>::new();
    failed.set_exception(LoopError::Reentrancy).unwrap();
    assert!(matches!(host.run_until_complete(failed), Err(LoopError::Reentrancy)));
    host.close().unwrap();
}

#[test]
fn teardown_failure_is_reported_by_close() {
    let host = LoopHost::with_hooks(test_config("broken-teardown"), Arc::new(BrokenTeardown));
    host.start().unwrap();
    let err = host.close().unwrap_err();
    assert_eq!(err.to_string(), "teardown exploded");
    assert!(host.is_closed());
    assert_eq!(host.phase(), HostPhase::Closed);
}

#[test]
fn callbacks_can_stop_the_main_loop() {
    let host = LoopHost::new(test_config("self-stop"));
    host.start().unwrap();

    let (tx, rx) = mpsc::channel();
    host.call_soon(move || {
        let result = current_loop().map(|h| h.stop());
        tx.send(result.map(|r| r.is_ok())).unwrap();
    })
    .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(true));

    // Queued behind the stop, so it waits for the next run.
    let (late_tx, late_rx) = mpsc::channel();
    host.call_soon(move || late_tx.send(()).unwrap()).unwrap();
    assert!(late_rx.recv_timeout(Duration::from_millis(100)).is_err());

    // The thread stays up; a blocking run restarts the main loop.
    assert_eq!(host.phase(), HostPhase::Running);
    let value = host
        .run_until_complete(Awaitable::coroutine(async { Ok::<_, LoopError>(1u8) }))
        .unwrap();
    assert_eq!(value, 1);
    late_rx.recv_timeout(WAIT).unwrap();
    host.close().unwrap();
}

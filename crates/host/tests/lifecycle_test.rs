//! Integration tests for the loop host lifecycle across caller threads.
//!
//! Covers blocking entry points, stop/close from the various threads, the
//! loop-stop race, and recovery after a failed startup.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use loopbridge_host::{
    await_future, current_loop, Awaitable, BoxError, CancelToken, HostPhase, LegacyFuture, LoopConfig,
    LoopError, LoopHooks, LoopHost,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(100);

fn host(name: &str) -> LoopHost {
    LoopHost::new(LoopConfig {
        thread_name: name.into(),
        ..LoopConfig::default()
    })
}

fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Run `f` on a fresh thread and hand back a receiver for its outcome.
fn in_thread<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx
}

/// Fails the first `failures` startups.
struct FlakyHooks {
    failures: AtomicUsize,
}

#[async_trait]
impl LoopHooks for FlakyHooks {
    async fn startup(&self) -> Result<(), BoxError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("flaky startup".into());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

#[test]
fn run_until_complete_on_fresh_host_returns_result() {
    let host = host("fresh");
    let value = host
        .run_until_complete(Awaitable::coroutine(async { Ok::<_, LoopError>(42) }))
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(host.phase(), HostPhase::NotStarted);
    host.close().unwrap();
}

#[test]
fn second_blocking_call_is_rejected_while_one_is_pending() {
    let host = host("reentrancy");
    host.start().unwrap();

    let pending = LegacyFuture::<u32>::new();
    let outcome = {
        let host = host.clone();
        let pending = pending.clone();
        in_thread(move || host.run_until_complete(pending))
    };
    wait_until("the pending future to be awaited", || pending.callback_count() > 0);

    let err = host
        .run_until_complete(Awaitable::coroutine(async { Ok::<_, LoopError>(1u32) }))
        .unwrap_err();
    assert!(matches!(err, LoopError::Reentrancy), "got {err:?}");
    assert!(matches!(host.run_forever(), Err(LoopError::Reentrancy)));

    pending.set_result(5).unwrap();
    assert_eq!(outcome.recv_timeout(TIMEOUT).unwrap().unwrap(), 5);
    host.close().unwrap();
}

#[test]
fn blocking_call_from_the_scheduler_thread_is_rejected() {
    let host = host("nested");
    host.start().unwrap();

    let (tx, rx) = mpsc::channel();
    host.call_soon(move || {
        let nested = current_loop()
            .expect("callbacks run on the scheduler thread")
            .run_until_complete(Awaitable::coroutine(async { Ok::<_, LoopError>(()) }));
        tx.send(nested).unwrap();
    })
    .unwrap();

    let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap_err();
    assert!(matches!(err, LoopError::Reentrancy), "got {err:?}");
    host.close().unwrap();
}

#[test]
fn close_from_the_scheduler_thread_is_rejected() {
    let host = host("self-close");
    host.start().unwrap();

    let (tx, rx) = mpsc::channel();
    host.call_soon(move || {
        let closed = current_loop().map(|h| h.close());
        tx.send(closed).unwrap();
    })
    .unwrap();

    let err = rx.recv_timeout(TIMEOUT).unwrap().unwrap().unwrap_err();
    assert!(matches!(err, LoopError::IllegalState(_)), "got {err:?}");
    assert_eq!(host.phase(), HostPhase::Running);
    assert!(!host.is_closed());

    host.close().unwrap();
    assert!(host.is_closed());
}

#[test]
fn stop_resolves_a_never_completing_future_with_loop_stopped() {
    let host = host("never");
    let never = LegacyFuture::<u32>::new();
    let outcome = {
        let host = host.clone();
        let never = never.clone();
        in_thread(move || host.run_until_complete(never))
    };
    wait_until("the future to be awaited", || never.callback_count() > 0);

    host.stop().unwrap();
    let err = outcome
        .recv_timeout(TIMEOUT)
        .expect("run_until_complete returns after stop")
        .unwrap_err();
    assert!(matches!(err, LoopError::LoopStopped), "got {err:?}");

    assert!(!never.done());
    assert_eq!(never.callback_count(), 0);
    host.close().unwrap();
}

#[test]
fn stop_from_another_thread_ends_run_forever() {
    let host = host("forever");

    for round in 0..2 {
        let outcome = {
            let host = host.clone();
            in_thread(move || host.run_forever())
        };
        wait_until("the scheduler thread", || host.is_running());
        thread::sleep(SETTLE);

        host.stop().unwrap();
        outcome
            .recv_timeout(TIMEOUT)
            .unwrap_or_else(|_| panic!("run_forever returned in round {round}"))
            .unwrap();
        assert_eq!(host.phase(), HostPhase::NotStarted);
    }
    host.close().unwrap();
}

#[test]
fn stop_discards_a_coroutine_suspended_in_await_future() {
    let host = host("stopped-coroutine");
    host.start().unwrap();

    let never = LegacyFuture::<u32>::new();
    let resumed = Arc::new(AtomicBool::new(false));
    let coro = {
        let never = never.clone();
        let resumed = resumed.clone();
        async move {
            let value = await_future(&never, &CancelToken::new()).await?;
            resumed.store(true, Ordering::SeqCst);
            Ok::<_, LoopError>(value)
        }
    };
    let outcome = {
        let host = host.clone();
        in_thread(move || host.run_until_complete(Awaitable::coroutine(coro)))
    };
    wait_until("the coroutine to await the future", || never.callback_count() > 0);

    host.stop().unwrap();
    let err = outcome
        .recv_timeout(TIMEOUT)
        .expect("run_until_complete returns after stop")
        .unwrap_err();
    assert!(matches!(err, LoopError::LoopStopped), "got {err:?}");
    wait_until("the coroutine to let go of the future", || never.callback_count() == 0);

    never.set_result(1).unwrap();
    thread::sleep(SETTLE);
    assert!(!resumed.load(Ordering::SeqCst), "coroutine body ran after the loop stopped");
    assert_eq!(host.phase(), HostPhase::Running);
    host.close().unwrap();
}

#[test]
fn stop_returns_only_after_run_forever_has_returned() {
    let host = host("stop-waits");
    let outcome = {
        let host = host.clone();
        in_thread(move || host.run_forever())
    };
    wait_until("the scheduler thread", || host.is_running());
    thread::sleep(SETTLE);

    host.stop().unwrap();
    // The ephemeral thread is already gone and the blocking slot is free.
    assert_eq!(host.phase(), HostPhase::NotStarted);
    let value = host
        .run_until_complete(Awaitable::coroutine(async { Ok::<_, LoopError>(9u8) }))
        .unwrap();
    assert_eq!(value, 9);

    outcome.recv_timeout(TIMEOUT).unwrap().unwrap();
    host.close().unwrap();
}

#[test]
fn failed_startup_is_reported_and_the_host_recovers() {
    let hooks = Arc::new(FlakyHooks {
        failures: AtomicUsize::new(1),
    });
    let host = LoopHost::with_hooks(
        LoopConfig {
            thread_name: "flaky".into(),
            ..LoopConfig::default()
        },
        hooks,
    );

    match host.run_forever() {
        Err(LoopError::StartupFailed(cause)) => assert_eq!(cause.to_string(), "flaky startup"),
        other => panic!("expected a startup failure, got {other:?}"),
    }
    assert_eq!(host.phase(), HostPhase::NotStarted);

    let outcome = {
        let host = host.clone();
        in_thread(move || host.run_forever())
    };
    wait_until("the scheduler thread", || host.is_running());
    thread::sleep(SETTLE);
    host.stop().unwrap();
    outcome.recv_timeout(TIMEOUT).unwrap().unwrap();
    host.close().unwrap();
}

#[test]
fn scope_cancellation_reaches_the_legacy_future_once() {
    let host = host("cancel-once");
    let (requested_tx, requested_rx) = mpsc::channel();
    let requests = Arc::new(AtomicUsize::new(0));
    let legacy = {
        let requests = requests.clone();
        let requested_tx = std::sync::Mutex::new(requested_tx);
        LegacyFuture::<u32>::with_cancel_handler(move || {
            requests.fetch_add(1, Ordering::SeqCst);
            let _ = requested_tx.lock().unwrap().send(());
        })
    };

    let scope = CancelToken::new();
    let coro = {
        let legacy = legacy.clone();
        let scope = scope.clone();
        async move { await_future(&legacy, &scope).await }
    };
    let outcome = {
        let host = host.clone();
        in_thread(move || host.run_until_complete(Awaitable::coroutine(coro)))
    };
    wait_until("the legacy future to be awaited", || legacy.callback_count() > 0);

    scope.cancel();
    requested_rx.recv_timeout(TIMEOUT).unwrap();
    thread::sleep(SETTLE);
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    assert!(!legacy.done(), "cancellation is only requested");

    assert!(legacy.set_cancelled());
    let err = outcome.recv_timeout(TIMEOUT).unwrap().unwrap_err();
    assert!(err.is_cancelled(), "got {err:?}");
    assert_eq!(requests.load(Ordering::SeqCst), 1);
    host.close().unwrap();
}

//! Reader, writer and signal registrations.
//!
//! Registrations are recorded here and armed only while the scheduler thread
//! is up: readiness comes from tokio (`AsyncFd`, unix signal streams) and each
//! event queues the callback as an ordinary handle. Disarming keeps the
//! registration so the next scheduler thread can arm it again.
//!
//! Each fd watcher polls its own duplicate of the descriptor, so a reader and
//! a writer on one socket, or a watcher that is still being torn down, never
//! collide in the reactor.

use std::collections::HashMap;
use std::os::unix::io::{BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use loopbridge_core::LoopError;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::handle::Handle;
use crate::queue::DispatchQueue;

pub(crate) type WatchCallback = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

struct Registration {
    callback: WatchCallback,
    task: Option<JoinHandle<()>>,
}

impl Registration {
    fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    readers: Mutex<HashMap<RawFd, Registration>>,
    writers: Mutex<HashMap<RawFd, Registration>>,
    signals: Mutex<HashMap<i32, Registration>>,
    armed: AtomicBool,
}

fn lock<K, V>(map: &Mutex<HashMap<K, V>>) -> MutexGuard<'_, HashMap<K, V>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    fn fds(&self, direction: Direction) -> &Mutex<HashMap<RawFd, Registration>> {
        match direction {
            Direction::Read => &self.readers,
            Direction::Write => &self.writers,
        }
    }

    fn can_arm(&self) -> bool {
        self.armed.load(Ordering::SeqCst) && tokio::runtime::Handle::try_current().is_ok()
    }

    pub(crate) fn add_fd(
        &self,
        direction: Direction,
        fd: RawFd,
        callback: WatchCallback,
        queue: &Arc<DispatchQueue>,
    ) -> Result<(), LoopError> {
        let task = if self.can_arm() {
            Some(arm_fd(direction, fd, callback.clone(), queue.clone())?)
        } else {
            None
        };
        let armed = task.is_some();
        // Replacing drops (and disarms) the previous registration.
        lock(self.fds(direction)).insert(fd, Registration { callback, task });
        debug!(fd, direction = ?direction, armed, "fd registered");
        Ok(())
    }

    pub(crate) fn remove_fd(&self, direction: Direction, fd: RawFd) -> bool {
        lock(self.fds(direction)).remove(&fd).is_some()
    }

    pub(crate) fn has_fd(&self, direction: Direction, fd: RawFd) -> bool {
        lock(self.fds(direction)).contains_key(&fd)
    }

    pub(crate) fn add_signal(
        &self,
        signum: i32,
        callback: WatchCallback,
        queue: &Arc<DispatchQueue>,
    ) -> Result<(), LoopError> {
        let task = if self.can_arm() {
            Some(arm_signal(signum, callback.clone(), queue.clone())?)
        } else {
            None
        };
        lock(&self.signals).insert(signum, Registration { callback, task });
        debug!(signum, "signal handler registered");
        Ok(())
    }

    pub(crate) fn remove_signal(&self, signum: i32) -> bool {
        lock(&self.signals).remove(&signum).is_some()
    }

    pub(crate) fn has_signal(&self, signum: i32) -> bool {
        lock(&self.signals).contains_key(&signum)
    }

    /// Arm every registration on the current runtime.
    pub(crate) fn arm_all(&self, queue: &Arc<DispatchQueue>) -> Result<(), LoopError> {
        self.armed.store(true, Ordering::SeqCst);
        for direction in [Direction::Read, Direction::Write] {
            for (fd, reg) in lock(self.fds(direction)).iter_mut() {
                if reg.task.is_none() {
                    reg.task = Some(arm_fd(direction, *fd, reg.callback.clone(), queue.clone())?);
                }
            }
        }
        for (signum, reg) in lock(&self.signals).iter_mut() {
            if reg.task.is_none() {
                reg.task = Some(arm_signal(*signum, reg.callback.clone(), queue.clone())?);
            }
        }
        Ok(())
    }

    pub(crate) fn disarm_all(&self) {
        self.armed.store(false, Ordering::SeqCst);
        for map in [&self.readers, &self.writers] {
            lock(map).values_mut().for_each(Registration::disarm);
        }
        lock(&self.signals).values_mut().for_each(Registration::disarm);
    }

    pub(crate) fn clear(&self) {
        self.disarm_all();
        lock(&self.readers).clear();
        lock(&self.writers).clear();
        lock(&self.signals).clear();
    }
}

fn arm_fd(
    direction: Direction,
    fd: RawFd,
    callback: WatchCallback,
    queue: Arc<DispatchQueue>,
) -> Result<JoinHandle<()>, LoopError> {
    let interest = match direction {
        Direction::Read => Interest::READABLE,
        Direction::Write => Interest::WRITABLE,
    };
    // SAFETY: callers keep `fd` open while it is registered.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let watched: AsyncFd<OwnedFd> = AsyncFd::with_interest(borrowed.try_clone_to_owned()?, interest)?;

    Ok(tokio::spawn(async move {
        loop {
            let ready = match direction {
                Direction::Read => watched.readable().await,
                Direction::Write => watched.writable().await,
            };
            let mut guard = match ready {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(fd, error = %e, "fd watcher failed");
                    return;
                }
            };

            let (done_tx, done_rx) = oneshot::channel();
            let callback = callback.clone();
            queue.push(Handle::new(move || {
                callback();
                let _ = done_tx.send(());
            }));
            // Re-arm only after the callback had its chance to consume the event.
            let _ = done_rx.await;
            guard.clear_ready();
        }
    }))
}

fn arm_signal(
    signum: i32,
    callback: WatchCallback,
    queue: Arc<DispatchQueue>,
) -> Result<JoinHandle<()>, LoopError> {
    let mut stream = signal(SignalKind::from_raw(signum))?;
    Ok(tokio::spawn(async move {
        while stream.recv().await.is_some() {
            let callback = callback.clone();
            queue.push(Handle::new(move || callback()));
        }
    }))
}

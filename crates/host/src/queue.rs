//! FIFO of pending handles, consumed by the pump on the scheduler thread.
//!
//! Producers may run on any thread. Once the scheduler thread has installed a
//! [`ReentryToken`], pushes from other threads, and pushes from the scheduler
//! thread while a transfer is still in flight, are relayed through the token
//! so that no producer's handles overtake each other.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tokio::sync::mpsc;

use crate::handle::{Handle, HandleRef};
use crate::token::ReentryToken;

pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<Handle>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Handle>>,
    relay: Arc<Mutex<Relay>>,
}

/// Every send into `tx` happens under this lock.
struct Relay {
    route: Option<Route>,
    /// Relayed handles not yet enqueued, oldest first.
    backlog: VecDeque<Handle>,
    /// Transfers sent through the token that have not landed yet.
    in_flight: usize,
}

struct Route {
    token: ReentryToken,
    owner: ThreadId,
}

fn lock(relay: &Mutex<Relay>) -> MutexGuard<'_, Relay> {
    relay.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Moves the oldest backlog entry into the queue when run or dropped. The
/// last one to land also flushes handles that queued up behind it without a
/// transfer of their own.
struct Transfer {
    relay: Arc<Mutex<Relay>>,
    tx: mpsc::UnboundedSender<Handle>,
}

impl Drop for Transfer {
    fn drop(&mut self) {
        let mut relay = lock(&self.relay);
        relay.in_flight = relay.in_flight.saturating_sub(1);
        let count = if relay.in_flight == 0 { relay.backlog.len() } else { 1 };
        for _ in 0..count {
            if let Some(handle) = relay.backlog.pop_front() {
                // The receiver lives as long as the queue itself.
                let _ = self.tx.send(handle);
            }
        }
    }
}

impl DispatchQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            relay: Arc::new(Mutex::new(Relay {
                route: None,
                backlog: VecDeque::new(),
                in_flight: 0,
            })),
        }
    }

    /// Enqueue a handle. Never blocks.
    pub fn push(&self, handle: Handle) -> HandleRef {
        let handle_ref = handle.handle_ref();
        let mut relay = lock(&self.relay);
        let foreign = relay
            .route
            .as_ref()
            .is_some_and(|route| thread::current().id() != route.owner);
        if relay.backlog.is_empty() && !foreign {
            let _ = self.tx.send(handle);
            return handle_ref;
        }

        relay.backlog.push_back(handle);
        // Without a token the handle waits for the transfers ahead of it.
        let Some(token) = relay.route.as_ref().map(|route| route.token.clone()) else {
            return handle_ref;
        };
        relay.in_flight += 1;
        let transfer = Transfer {
            relay: Arc::clone(&self.relay),
            tx: self.tx.clone(),
        };
        let refused = token.run_sync_soon(Box::new(move || drop(transfer))).err();
        drop(relay);
        // A closed relay hands the transfer back; it lands in order here.
        drop(refused);
        handle_ref
    }

    /// Wait for the next handle. Suspends only the calling task.
    pub async fn pop(&self) -> Option<Handle> {
        self.rx.lock().await.recv().await
    }

    /// Route future pushes through `token`, with `owner` as the scheduler thread.
    pub fn install_token(&self, token: ReentryToken, owner: ThreadId) {
        lock(&self.relay).route = Some(Route { token, owner });
    }

    /// Return to direct pushes once the transfers in flight have landed.
    pub fn remove_token(&self) {
        lock(&self.relay).route = None;
    }

    /// Relayed handles that have not reached the queue yet.
    pub fn pending_transfers(&self) -> usize {
        lock(&self.relay).backlog.len()
    }

    /// Drop every queued handle. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let Ok(mut rx) = self.rx.try_lock() else {
            return 0;
        };
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

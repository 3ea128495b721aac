//! Debounced background push.
//!
//! Local writes call [`PushScheduler::schedule`]; a burst of writes results
//! in one background drain after the debounce window. Explicit callers use
//! [`PushScheduler::flush`] instead.
//!
//! The background worker stays armed while anything is pending: after each
//! drain it sleeps until the earliest retry comes due, or until the quota
//! guard's deadline passes, and drains again. It exits once the queue holds
//! nothing pending.

use crate::error::SyncResult;
use crate::queue::SyncQueue;
use crate::quota::QuotaGuard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

struct PushInner {
    queue: SyncQueue,
    guard: Arc<QuotaGuard>,
    debounce: Duration,
    scheduled: AtomicBool,
    wake: Notify,
}

#[derive(Clone)]
pub struct PushScheduler {
    inner: Arc<PushInner>,
}

impl PushScheduler {
    pub fn new(queue: SyncQueue, guard: Arc<QuotaGuard>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(PushInner {
                queue,
                guard,
                debounce,
                scheduled: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        }
    }

    /// Arranges a background drain after the debounce window. Calls made
    /// while the worker is armed wake it instead of starting another.
    pub fn schedule(&self) {
        if self.inner.scheduled.swap(true, Ordering::SeqCst) {
            self.inner.wake.notify_one();
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for background push; tasks stay queued");
            self.inner.scheduled.store(false, Ordering::SeqCst);
            return;
        };
        handle.spawn(Arc::clone(&self.inner).run());
    }

    /// Drains the queue now.
    pub async fn flush(&self) -> SyncResult<usize> {
        self.inner.queue.drain_sync_queue().await
    }
}

impl PushInner {
    async fn run(self: Arc<Self>) {
        let mut guard_rx = self.guard.subscribe();
        guard_rx.mark_unchanged();
        let mut delay = self.debounce;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => tokio::time::sleep(self.debounce).await,
                Ok(()) = guard_rx.changed() => {}
            }

            match self.queue.drain_sync_queue().await {
                Ok(0) => {}
                Ok(pushed) => debug!("Background push attempted {} tasks", pushed),
                Err(e) => warn!("Background push failed: {}", e),
            }

            if let Some(next) = self.next_wake() {
                delay = next;
                continue;
            }
            self.scheduled.store(false, Ordering::SeqCst);
            // A write between the check and the reset saw the worker armed.
            if self.next_wake().is_none() || self.scheduled.swap(true, Ordering::SeqCst) {
                return;
            }
            delay = self.debounce;
        }
    }

    /// Time until the next drain can make progress, never below the
    /// debounce. `None` when nothing is pending.
    fn next_wake(&self) -> Option<Duration> {
        match self.queue.next_wake() {
            Ok(next) => next.map(|delay| delay.max(self.debounce)),
            Err(e) => {
                warn!("Failed to read next retry time: {}", e);
                None
            }
        }
    }
}

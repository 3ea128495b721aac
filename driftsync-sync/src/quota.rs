//! Circuit breaker for remote quota and availability failures.
//!
//! When the remote backend reports quota exhaustion or unavailability,
//! remote work is disabled for a window (one hour by default). Queue runs
//! become no-ops and live listeners fall back to polling until the deadline
//! passes. The deadline is persisted so a restart does not hammer a backend
//! that just refused service.

use crate::error::{SyncError, SyncResult};
use driftsync_storage::QueueStore;
use driftsync_types::Clock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Window used by [`QuotaGuard::mark_disabled`].
pub const DEFAULT_DISABLE_WINDOW: Duration = Duration::from_secs(60 * 60);

const DEADLINE_KEY: &str = "quota_disabled_until";

/// Process-wide breaker state. Cheap to share behind an `Arc`.
pub struct QuotaGuard {
    store: QueueStore,
    clock: Arc<dyn Clock>,
    window: Duration,
    /// Deadline in ms; 0 when never tripped.
    deadline: watch::Sender<i64>,
}

impl QuotaGuard {
    /// Creates a guard, restoring a persisted deadline if one is stored.
    pub fn new(store: QueueStore, clock: Arc<dyn Clock>, window: Duration) -> SyncResult<Self> {
        let persisted = match store.meta_get(DEADLINE_KEY)? {
            Some(raw) => raw.parse::<i64>().unwrap_or_else(|_| {
                warn!("Ignoring unreadable quota deadline {:?}", raw);
                0
            }),
            None => 0,
        };
        if persisted > clock.now_ms() {
            info!("Remote sync disabled until {} (restored)", persisted);
        }
        Ok(Self {
            store,
            clock,
            window,
            deadline: watch::channel(persisted).0,
        })
    }

    /// Disables remote work for the configured window.
    pub fn mark_disabled(&self) {
        self.mark_disabled_for(self.window);
    }

    /// Disables remote work for `duration` from now. Never shortens an
    /// existing deadline.
    pub fn mark_disabled_for(&self, duration: Duration) {
        let until = self.clock.now_ms().saturating_add(duration.as_millis() as i64);
        let extended = self.deadline.send_if_modified(|deadline| {
            if until > *deadline {
                *deadline = until;
                true
            } else {
                false
            }
        });
        if !extended {
            return;
        }
        warn!("Remote sync disabled for {:?} (until {})", duration, until);
        if let Err(e) = self.store.meta_set(DEADLINE_KEY, &until.to_string()) {
            warn!("Failed to persist quota deadline: {}", e);
        }
    }

    /// True while the deadline is in the future.
    pub fn is_disabled(&self) -> bool {
        *self.deadline.borrow() > self.clock.now_ms()
    }

    /// The active deadline, if any.
    pub fn disabled_until(&self) -> Option<i64> {
        let deadline = *self.deadline.borrow();
        (deadline > self.clock.now_ms()).then_some(deadline)
    }

    /// Re-enables remote work immediately.
    pub fn clear(&self) {
        self.deadline.send_replace(0);
        if let Err(e) = self.store.meta_delete(DEADLINE_KEY) {
            warn!("Failed to clear persisted quota deadline: {}", e);
        }
        info!("Remote sync re-enabled");
    }

    /// Notified whenever the deadline is set or cleared.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.deadline.subscribe()
    }

    /// Runs a remote operation, tripping the breaker if it fails with a
    /// quota-class error. The error is returned either way.
    pub async fn with_guard<T, F>(&self, op: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        let result = op.await;
        if let Err(e) = &result {
            self.observe(e);
        }
        result
    }

    /// Trips the breaker when `error` is quota-class. Returns whether it did.
    pub fn observe(&self, error: &SyncError) -> bool {
        if error.is_quota_class() {
            self.mark_disabled();
            true
        } else {
            false
        }
    }
}

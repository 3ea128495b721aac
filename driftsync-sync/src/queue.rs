//! Durable outbound task queue.
//!
//! Every remote mutation is a persisted [`SyncTask`] processed by the
//! [`TaskProcessor`] registered for its [`TaskType`]. The queue provides:
//!
//! - dedupe: at most one live task per dedupe key; re-enqueueing replaces
//!   the payload instead of adding a task
//! - backoff: a failed attempt puts the task back to pending, due after
//!   `min(base * attempts, cap)`; at `max_attempts` it is parked as failed
//! - fail-open dispatch: a task whose type has no processor is dropped
//! - single flight: concurrent run triggers join the one in-flight run and
//!   all receive its outcome
//! - stats: counts by status, broadcast after every mutation
//!
//! Runs are no-ops while the [`QuotaGuard`] is tripped. [`SyncQueue::next_wake`]
//! tells a background driver when the next run can make progress.

use crate::config::QueueConfig;
use crate::error::{SyncError, SyncResult};
use crate::quota::QuotaGuard;
use crate::subscription::Subscription;
use async_trait::async_trait;
use driftsync_storage::QueueStore;
use driftsync_types::{Clock, QueueStats, SyncTask, TaskStatus, TaskType};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Handles tasks of one [`TaskType`].
///
/// `Ok` deletes the task. `Err` reschedules it as pending with backoff, or
/// parks it as failed when the error is not retryable or attempts are
/// exhausted.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &SyncTask) -> SyncResult<()>;
}

struct FnProcessor<F>(F);

#[async_trait]
impl<F, Fut> TaskProcessor for FnProcessor<F>
where
    F: Fn(SyncTask) -> Fut + Send + Sync,
    Fut: Future<Output = SyncResult<()>> + Send,
{
    async fn process(&self, task: &SyncTask) -> SyncResult<()> {
        (self.0)(task.clone()).await
    }
}

/// Wraps an async closure as a processor.
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn TaskProcessor>
where
    F: Fn(SyncTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<()>> + Send + 'static,
{
    Arc::new(FnProcessor(f))
}

/// Options for [`SyncQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Coalesce with the live task holding this key.
    pub dedupe_key: Option<String>,
    /// Start a background run right after persisting.
    pub attempt_immediate: bool,
}

impl EnqueueOptions {
    pub fn deduped(key: impl Into<String>) -> Self {
        Self {
            dedupe_key: Some(key.into()),
            attempt_immediate: false,
        }
    }

    pub fn immediate(mut self) -> Self {
        self.attempt_immediate = true;
        self
    }
}

type QueueRun = Shared<BoxFuture<'static, SyncResult<usize>>>;

struct QueueInner {
    store: QueueStore,
    clock: Arc<dyn Clock>,
    guard: Arc<QuotaGuard>,
    config: QueueConfig,
    processors: RwLock<HashMap<TaskType, Arc<dyn TaskProcessor>>>,
    in_flight: Mutex<Option<(u64, QueueRun)>>,
    next_run: AtomicU64,
    stats: watch::Sender<QueueStats>,
}

/// The sync task queue. Clones share one queue.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncQueue {
    pub fn new(
        store: QueueStore,
        clock: Arc<dyn Clock>,
        guard: Arc<QuotaGuard>,
        config: QueueConfig,
    ) -> SyncResult<Self> {
        let stats = store.stats()?;
        Ok(Self {
            inner: Arc::new(QueueInner {
                store,
                clock,
                guard,
                config,
                processors: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(None),
                next_run: AtomicU64::new(1),
                stats: watch::channel(stats).0,
            }),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Registers (or replaces) the processor for a task type.
    pub fn register_sync_processor(&self, task_type: TaskType, processor: Arc<dyn TaskProcessor>) {
        let mut processors = self
            .inner
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if processors.insert(task_type.clone(), processor).is_some() {
            debug!("Replaced sync processor for {}", task_type);
        }
    }

    /// Persists a task, coalescing with the live task sharing its dedupe
    /// key. A coalesced task takes the new type and payload and becomes due
    /// now; its attempt count is kept.
    pub fn enqueue(
        &self,
        task_type: TaskType,
        payload: Value,
        options: EnqueueOptions,
    ) -> SyncResult<SyncTask> {
        let now = self.inner.clock.now_ms();
        let existing = match options.dedupe_key.as_deref() {
            Some(key) => self.inner.store.find_by_dedupe_key(key)?,
            None => None,
        };

        let task = match existing {
            Some(mut task) => {
                task.task_type = task_type;
                task.payload = payload;
                task.status = TaskStatus::Pending;
                task.next_retry_at = now;
                task.last_error = None;
                self.inner.store.update(&task)?;
                debug!("Coalesced {} into task {}", task.task_type, task.id);
                task
            }
            None => {
                let task = SyncTask::new(task_type, payload, options.dedupe_key, now);
                self.inner.store.insert(&task)?;
                debug!("Enqueued {} as task {}", task.task_type, task.id);
                task
            }
        };
        self.inner.publish_stats();

        if options.attempt_immediate {
            self.spawn_run();
        }
        Ok(task)
    }

    /// Removes the task holding `dedupe_key`, if any. Used when a newer
    /// remote version overrides the local write the task would push.
    pub fn discard(&self, dedupe_key: &str) -> SyncResult<bool> {
        let removed = self.inner.store.delete_by_dedupe_key(dedupe_key)?;
        if removed {
            debug!("Discarded queued task {}; a newer remote version won", dedupe_key);
            self.inner.publish_stats();
        }
        Ok(removed)
    }

    /// Time until a run could next make progress: the earliest pending
    /// retry, held back to the quota guard's deadline while it is tripped.
    /// `None` when nothing is pending.
    pub fn next_wake(&self) -> SyncResult<Option<Duration>> {
        let Some(retry_at) = self.inner.store.next_retry_at()? else {
            return Ok(None);
        };
        let wake_at = match self.inner.guard.disabled_until() {
            Some(until) => retry_at.max(until),
            None => retry_at,
        };
        let wait = wake_at.saturating_sub(self.inner.clock.now_ms()).max(0);
        Ok(Some(Duration::from_millis(wait as u64)))
    }

    /// Processes up to `limit` due tasks. A call made while a run is in
    /// flight joins that run and returns its outcome. Returns the number of
    /// tasks attempted; 0 while the quota guard is tripped.
    pub async fn process_sync_queue(&self, limit: usize) -> SyncResult<usize> {
        let (run_id, run) = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.as_ref() {
                Some((id, run)) => (*id, run.clone()),
                None => {
                    let id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
                    let run = self.inner.clone().run_pass(limit).boxed().shared();
                    *in_flight = Some((id, run.clone()));
                    (id, run)
                }
            }
        };

        let result = run.await;

        let mut in_flight = lock(&self.inner.in_flight);
        if in_flight.as_ref().is_some_and(|(id, _)| *id == run_id) {
            *in_flight = None;
        }
        result
    }

    /// Runs passes until one attempts nothing. Returns the total attempted.
    pub async fn drain_sync_queue(&self) -> SyncResult<usize> {
        let mut total = 0;
        loop {
            let processed = self
                .process_sync_queue(self.inner.config.batch_limit)
                .await?;
            if processed == 0 {
                break;
            }
            total += processed;
        }
        Ok(total)
    }

    /// Calls `on_stats` with the current counts, then after every change,
    /// until the subscription is dropped.
    pub fn subscribe_sync_queue<F>(&self, on_stats: F) -> Subscription
    where
        F: Fn(QueueStats) + Send + 'static,
    {
        let mut rx = self.inner.stats.subscribe();
        let current = *rx.borrow_and_update();
        on_stats(current);
        Subscription::new(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let stats = *rx.borrow_and_update();
                on_stats(stats);
            }
        }))
    }

    /// Current counts.
    pub fn stats(&self) -> QueueStats {
        *self.inner.stats.borrow()
    }

    /// Every persisted task, oldest first.
    pub fn tasks(&self) -> SyncResult<Vec<SyncTask>> {
        Ok(self.inner.store.all()?)
    }

    /// Whether a run is in flight.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.in_flight).is_some()
    }

    /// Returns tasks stranded in `processing` by a crash to `pending`.
    pub fn recover_interrupted(&self) -> SyncResult<usize> {
        let reset = self
            .inner
            .store
            .reset_processing(self.inner.clock.now_ms())?;
        if reset > 0 {
            info!("Recovered {} interrupted sync tasks", reset);
        }
        self.inner.publish_stats();
        Ok(reset)
    }

    /// Makes every parked task due now. Attempt counts are kept.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        let revived = self.inner.store.revive_failed(self.inner.clock.now_ms())?;
        self.inner.publish_stats();
        Ok(revived)
    }

    fn spawn_run(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for an immediate sync attempt; task stays queued");
            return;
        };
        let queue = self.clone();
        handle.spawn(async move {
            let limit = queue.inner.config.batch_limit;
            if let Err(e) = queue.process_sync_queue(limit).await {
                warn!("Immediate sync attempt failed: {}", e);
            }
        });
    }
}

impl QueueInner {
    async fn run_pass(self: Arc<Self>, limit: usize) -> SyncResult<usize> {
        if self.guard.is_disabled() {
            debug!("Quota guard tripped; skipping queue run");
            return Ok(0);
        }
        let due = self.store.due(self.clock.now_ms(), limit)?;
        let mut processed = 0;
        for task in due {
            if self.guard.is_disabled() {
                debug!("Quota guard tripped mid-run; deferring remaining tasks");
                break;
            }
            if self.run_task(task).await? {
                processed += 1;
            }
        }
        Ok(processed)
    }

    /// Runs one task. Returns false if it was no longer due when reached.
    async fn run_task(&self, task: SyncTask) -> SyncResult<bool> {
        let now = self.clock.now_ms();
        let Some(mut task) = self.store.get(&task.id)? else {
            return Ok(false);
        };
        if !task.is_due(now) {
            return Ok(false);
        }

        let Some(processor) = self.processor_for(&task.task_type) else {
            warn!("No processor registered for {}; dropping task {}", task.task_type, task.id);
            self.store.delete(&task.id)?;
            self.publish_stats();
            return Ok(true);
        };

        task.status = TaskStatus::Processing;
        task.attempts += 1;
        task.last_tried_at = Some(now);

        self.store.update(&task)?;
        self.publish_stats();

        let outcome = processor.process(&task).await;

        // An enqueue with the same dedupe key may have replaced the task
        // while it ran; the replacement stays pending with its own payload.
        let superseded = match self.store.get(&task.id)? {
            Some(current) => {
                current.status != TaskStatus::Processing
                    || current.payload != task.payload
                    || current.task_type != task.task_type
            }
            None => true,
        };

        if superseded {
            debug!("Task {} changed while running; keeping the newer version", task.id);
        } else {
            match outcome {
                Ok(()) => {
                    self.store.delete(&task.id)?;
                    debug!("Synced {} task {}", task.task_type, task.id);
                }
                Err(e) => self.schedule_retry(task, &e)?,
            }
        }
        self.publish_stats();
        Ok(true)
    }

    fn schedule_retry(&self, mut task: SyncTask, error: &SyncError) -> SyncResult<()> {
        let now = self.clock.now_ms();
        task.last_error = Some(error.to_string());

        if !error.is_retryable() {
            task.park();
            warn!("Task {} ({}) failed permanently: {}", task.id, task.task_type, error);
        } else if task.attempts >= self.config.max_attempts {
            task.park();
            warn!(
                "Task {} ({}) parked after {} attempts: {}",
                task.id, task.task_type, task.attempts, error
            );
        } else {
            let delay = self.config.backoff(task.attempts);
            task.status = TaskStatus::Pending;
            task.next_retry_at = now.saturating_add(delay.as_millis() as i64);
            debug!(
                "Task {} ({}) failed on attempt {}, retrying in {:?}: {}",
                task.id, task.task_type, task.attempts, delay, error
            );
        }
        self.store.update(&task)?;
        Ok(())
    }

    fn processor_for(&self, task_type: &TaskType) -> Option<Arc<dyn TaskProcessor>> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .cloned()
    }

    fn publish_stats(&self) {
        match self.store.stats() {
            Ok(stats) => {
                self.stats.send_if_modified(|current| {
                    if *current == stats {
                        false
                    } else {
                        *current = stats;
                        true
                    }
                });
            }
            Err(e) => warn!("Failed to recompute queue stats: {}", e),
        }
    }
}

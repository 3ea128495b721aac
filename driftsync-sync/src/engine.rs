//! Sync engine: wires the stores, queue, guard and listeners together.

use crate::config::SyncConfig;
use crate::coordinator::LocalFirst;
use crate::error::{SyncError, SyncResult};
use crate::gate::{InteractionEvent, PullGate};
use crate::listener::{create_metadata_based_listener, ListenerConfig, ListenerContext};
use crate::pending::PendingChanges;
use crate::processor::{EntityBinding, EntityProcessor};
use crate::push::PushScheduler;
use crate::queue::{SyncQueue, TaskProcessor};
use crate::quota::QuotaGuard;
use crate::registry::ChangeRegistry;
use crate::remote::RemoteStore;
use crate::scheduler::{HostScheduler, TokioScheduler};
use crate::subscription::Subscription;
use driftsync_storage::{LocalStore, QueueStore};
use driftsync_types::{Clock, QueueStats, Record, SystemClock, TaskType};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// One engine per device. Owns the shared services; every handle it gives
/// out points at the same queue, guard and pending buffer.
pub struct SyncEngine {
    config: SyncConfig,
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    scheduler: Arc<dyn HostScheduler>,
    guard: Arc<QuotaGuard>,
    registry: ChangeRegistry,
    pending: Arc<PendingChanges>,
    gate: Arc<PullGate>,
    queue: SyncQueue,
    local_first: LocalFirst,
}

impl SyncEngine {
    /// Creates an engine on the system clock and the tokio scheduler.
    pub fn new(
        config: SyncConfig,
        local: Arc<dyn LocalStore>,
        queue_store: QueueStore,
        remote: Arc<dyn RemoteStore>,
    ) -> SyncResult<Self> {
        Self::with_runtime(
            config,
            local,
            queue_store,
            remote,
            Arc::new(SystemClock),
            Arc::new(TokioScheduler),
        )
    }

    /// Creates an engine with an explicit clock and host scheduler.
    ///
    /// Tasks left in `processing` by an earlier crash are reset to
    /// `pending` here, and a background push is armed for whatever is
    /// pending.
    pub fn with_runtime(
        config: SyncConfig,
        local: Arc<dyn LocalStore>,
        queue_store: QueueStore,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn HostScheduler>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let guard = Arc::new(QuotaGuard::new(
            queue_store.clone(),
            clock.clone(),
            config.quota_disable_window(),
        )?);
        let queue = SyncQueue::new(queue_store, clock.clone(), guard.clone(), config.queue.clone())?;
        let recovered = queue.recover_interrupted()?;

        let registry = ChangeRegistry::new(remote.clone(), clock.clone());
        let pending = Arc::new(PendingChanges::new());
        let gate = Arc::new(PullGate::new(config.pull_cooldown(), clock.clone()));
        let push = PushScheduler::new(queue.clone(), guard.clone(), config.push_debounce());
        if queue.stats().pending > 0 {
            push.schedule();
        }
        let local_first = LocalFirst::new(
            local.clone(),
            queue.clone(),
            pending.clone(),
            push,
            clock,
            scheduler.clone(),
            config.chunk_size,
        );

        info!(
            "Sync engine ready ({} queued, {} recovered)",
            queue.stats().total(),
            recovered
        );
        Ok(Self {
            config,
            local,
            remote,
            scheduler,
            guard,
            registry,
            pending,
            gate,
            queue,
            local_first,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The local-first write path.
    pub fn local_first(&self) -> &LocalFirst {
        &self.local_first
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn quota_guard(&self) -> &Arc<QuotaGuard> {
        &self.guard
    }

    pub fn registry(&self) -> &ChangeRegistry {
        &self.registry
    }

    pub fn pull_gate(&self) -> &Arc<PullGate> {
        &self.gate
    }

    pub fn pending(&self) -> &Arc<PendingChanges> {
        &self.pending
    }

    /// Registers upsert, update and delete processors for an entity.
    pub fn register_entity(&self, binding: EntityBinding) {
        for task_type in binding.task_types() {
            let processor = EntityProcessor::new(
                task_type.kind,
                binding.clone(),
                self.remote.clone(),
                self.registry.clone(),
                self.guard.clone(),
                self.pending.clone(),
            );
            self.queue
                .register_sync_processor(task_type, Arc::new(processor));
        }
        info!(
            "Registered {} -> {} ({} dependents)",
            binding.entity_type,
            binding.collection,
            binding.dependents.len()
        );
    }

    /// Registers a custom processor for one task type.
    pub fn register_sync_processor(&self, task_type: TaskType, processor: Arc<dyn TaskProcessor>) {
        self.queue.register_sync_processor(task_type, processor);
    }

    /// A listener config carrying this engine's timer defaults.
    pub fn listener_config(&self, entity_type: &str, collection: &str) -> ListenerConfig {
        ListenerConfig::from_defaults(
            entity_type,
            collection,
            &self.config.listener,
            self.config.chunk_size,
        )
    }

    pub fn listener_context(&self) -> ListenerContext {
        ListenerContext {
            local: self.local.clone(),
            remote: self.remote.clone(),
            registry: self.registry.clone(),
            guard: self.guard.clone(),
            gate: self.gate.clone(),
            pending: self.pending.clone(),
            queue: self.queue.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    /// Starts a registry listener; see [`create_metadata_based_listener`].
    pub async fn create_metadata_based_listener<D, E>(
        &self,
        config: ListenerConfig,
        on_data: D,
        on_error: E,
    ) -> Subscription
    where
        D: Fn(Vec<Record>) + Send + Sync + 'static,
        E: Fn(SyncError) + Send + Sync + 'static,
    {
        create_metadata_based_listener(self.listener_context(), config, on_data, on_error).await
    }

    /// Arms the pull gate from host interaction events.
    pub fn attach_interactions(&self, events: broadcast::Receiver<InteractionEvent>) -> Subscription {
        self.gate.attach(events)
    }

    pub fn subscribe_sync_queue<F>(&self, on_stats: F) -> Subscription
    where
        F: Fn(QueueStats) + Send + 'static,
    {
        self.queue.subscribe_sync_queue(on_stats)
    }

    /// Pushes every queued task now.
    pub async fn flush(&self) -> SyncResult<usize> {
        self.local_first.flush().await
    }
}

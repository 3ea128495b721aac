//! Metadata-based listeners: keep a local table in step with a remote
//! collection while watching only its registry beacon.
//!
//! A listener:
//!
//! 1. reads the local table and hands it to `on_data` before any remote
//!    call, so the first paint never waits on the network
//! 2. watches the collection's registry entry and, when the stamp really
//!    changes, fetches the collection and reconciles the local table
//! 3. runs one delayed reconciliation after subscribe, unless a
//!    registry-triggered one already ran, plus a periodic one that only
//!    fires through the [`PullGate`]
//! 4. while the [`QuotaGuard`] is tripped, drops the live watch and polls
//!    the registry entry instead
//!
//! Reconciliation is last-write-wins on `updatedAt` and never deletes a
//! record that still has a pending local change or queued sync task. When
//! the remote version wins, the queued task for that record is discarded so
//! the older local write is never pushed over it.

use crate::chunk::{chunked_bulk_delete, chunked_bulk_put, chunked_to_array, DEFAULT_CHUNK_SIZE};
use crate::config::{ListenerDefaults, MIN_POLL_INTERVAL};
use crate::coordinator::dedupe_key;
use crate::error::{SyncError, SyncResult};
use crate::gate::PullGate;
use crate::pending::PendingChanges;
use crate::processor::write_stamp;
use crate::queue::SyncQueue;
use crate::quota::QuotaGuard;
use crate::registry::ChangeRegistry;
use crate::remote::RemoteStore;
use crate::scheduler::HostScheduler;
use crate::subscription::Subscription;
use driftsync_storage::LocalStore;
use driftsync_types::{Record, RegistryEntry};
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Per-listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Local table and pending-change key.
    pub entity_type: String,
    /// Remote collection and registry key.
    pub collection: String,
    /// Order of the records handed to `on_data`; `None` orders by id.
    pub order_field: Option<String>,
    pub reverse: bool,
    pub chunk_size: usize,
    pub initial_reconcile_delay: Duration,
    pub periodic_reconcile: Duration,
    /// Raised to at least 30s.
    pub poll_interval: Duration,
}

impl ListenerConfig {
    pub fn new(entity_type: impl Into<String>, collection: impl Into<String>) -> Self {
        Self::from_defaults(
            entity_type,
            collection,
            &ListenerDefaults::default(),
            DEFAULT_CHUNK_SIZE,
        )
    }

    pub fn from_defaults(
        entity_type: impl Into<String>,
        collection: impl Into<String>,
        defaults: &ListenerDefaults,
        chunk_size: usize,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            collection: collection.into(),
            order_field: None,
            reverse: false,
            chunk_size,
            initial_reconcile_delay: Duration::from_millis(defaults.initial_reconcile_delay_ms),
            periodic_reconcile: Duration::from_millis(defaults.periodic_reconcile_ms),
            poll_interval: Duration::from_millis(defaults.poll_interval_ms),
        }
    }

    pub fn order_by(mut self, field: impl Into<String>, reverse: bool) -> Self {
        self.order_field = Some(field.into());
        self.reverse = reverse;
        self
    }

    pub fn effective_poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

/// Shared services a listener runs against.
#[derive(Clone)]
pub struct ListenerContext {
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub registry: ChangeRegistry,
    pub guard: Arc<QuotaGuard>,
    pub gate: Arc<PullGate>,
    pub pending: Arc<PendingChanges>,
    pub queue: SyncQueue,
    pub scheduler: Arc<dyn HostScheduler>,
}

type DataCallback = Box<dyn Fn(Vec<Record>) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(SyncError) + Send + Sync>;
type RegistryFeed = BoxStream<'static, SyncResult<Option<RegistryEntry>>>;

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Registry,
    Initial,
    Periodic,
    Poll,
}

enum Wake {
    Registry(Option<SyncResult<Option<RegistryEntry>>>),
    InitialReconcile,
    PeriodicReconcile,
    Poll,
    GuardChanged,
}

struct Listener {
    ctx: ListenerContext,
    config: ListenerConfig,
    on_data: DataCallback,
    on_error: ErrorCallback,
}

/// Starts a listener. Returns once the local snapshot has been delivered;
/// remote work continues in the background until the subscription drops.
pub async fn create_metadata_based_listener<D, E>(
    ctx: ListenerContext,
    config: ListenerConfig,
    on_data: D,
    on_error: E,
) -> Subscription
where
    D: Fn(Vec<Record>) + Send + Sync + 'static,
    E: Fn(SyncError) + Send + Sync + 'static,
{
    let listener = Arc::new(Listener {
        ctx,
        config,
        on_data: Box::new(on_data),
        on_error: Box::new(on_error),
    });

    match listener.read_local().await {
        Ok(records) => (listener.on_data)(records),
        Err(e) => listener.report(e),
    }
    Subscription::new(tokio::spawn(listener.run()))
}

impl Listener {
    async fn run(self: Arc<Self>) {
        let collection = self.config.collection.as_str();
        let mut guard_rx = self.ctx.guard.subscribe();
        let mut feed: Option<RegistryFeed> = None;
        let mut last_seen: Option<RegistryEntry> = None;
        let mut reconciled = false;

        let initial = tokio::time::sleep(self.config.initial_reconcile_delay);
        tokio::pin!(initial);
        let mut initial_pending = true;

        let period = self.config.periodic_reconcile.max(Duration::from_millis(1));
        let mut periodic = tokio::time::interval_at(Instant::now() + period, period);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.ctx.guard.is_disabled() {
                if feed.take().is_some() {
                    info!(
                        "Quota guard tripped; polling {} every {:?}",
                        collection,
                        self.config.effective_poll_interval()
                    );
                }
            } else if feed.is_none() {
                match self.ctx.registry.watch(collection).await {
                    Ok(stream) => {
                        debug!("Watching registry entry for {}", collection);
                        feed = Some(stream);
                    }
                    Err(e) => {
                        self.ctx.guard.observe(&e);
                        self.report(e);
                    }
                }
            }

            let wake = match feed.as_mut() {
                Some(stream) => tokio::select! {
                    item = stream.next() => Wake::Registry(item),
                    _ = &mut initial, if initial_pending => Wake::InitialReconcile,
                    _ = periodic.tick() => Wake::PeriodicReconcile,
                    _ = guard_rx.changed() => Wake::GuardChanged,
                },
                None => tokio::select! {
                    _ = tokio::time::sleep(self.config.effective_poll_interval()) => Wake::Poll,
                    _ = guard_rx.changed() => Wake::GuardChanged,
                },
            };

            match wake {
                Wake::Registry(Some(Ok(entry))) => {
                    if observe(&mut last_seen, entry) {
                        reconciled |= self.reconcile(Trigger::Registry).await;
                    }
                }
                Wake::Registry(Some(Err(e))) => {
                    self.ctx.guard.observe(&e);
                    self.report(e);
                    feed = None;
                }
                Wake::Registry(None) => {
                    debug!("Registry watch for {} ended; re-attaching", collection);
                    feed = None;
                }
                Wake::InitialReconcile => {
                    initial_pending = false;
                    if reconciled {
                        debug!("Skipping delayed reconcile of {}; already current", collection);
                    } else {
                        reconciled |= self.reconcile(Trigger::Initial).await;
                    }
                }
                Wake::PeriodicReconcile => {
                    if self.ctx.gate.try_acquire() {
                        self.reconcile(Trigger::Periodic).await;
                    } else {
                        debug!("Periodic reconcile of {} held by pull gate", collection);
                    }
                }
                Wake::Poll => {
                    let polled = self
                        .ctx
                        .guard
                        .with_guard(self.ctx.registry.entry(collection))
                        .await;
                    match polled {
                        Ok(entry) => {
                            if observe(&mut last_seen, entry) {
                                reconciled |= self.reconcile(Trigger::Poll).await;
                            }
                        }
                        Err(e) => self.report(e),
                    }
                }
                Wake::GuardChanged => {}
            }
        }
    }

    /// Fetches, merges and publishes. Returns whether it succeeded.
    async fn reconcile(&self, trigger: Trigger) -> bool {
        self.ctx.gate.record_pull();
        match self.fetch_and_merge().await {
            Ok(records) => {
                debug!(
                    "Reconciled {} ({:?}): {} records",
                    self.config.collection,
                    trigger,
                    records.len()
                );
                self.ctx.scheduler.next_paint().await;
                (self.on_data)(records);
                true
            }
            Err(e) => {
                warn!("Reconcile of {} ({:?}) failed: {}", self.config.collection, trigger, e);
                self.report(e);
                false
            }
        }
    }

    async fn fetch_and_merge(&self) -> SyncResult<Vec<Record>> {
        let ctx = &self.ctx;
        let table = self.config.entity_type.as_str();
        let docs = ctx
            .guard
            .with_guard(async {
                ctx.remote
                    .list(&self.config.collection)
                    .await
                    .map_err(SyncError::from)
            })
            .await?;

        let local: HashMap<String, Record> = chunked_to_array(
            ctx.local.as_ref(),
            ctx.scheduler.as_ref(),
            table,
            self.config.chunk_size,
            None,
            false,
        )
        .await?
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect();

        // Queued writes outlive the pending buffer across restarts.
        let queued: HashMap<String, Option<i64>> = ctx
            .queue
            .tasks()?
            .into_iter()
            .filter_map(|task| {
                let stamp = write_stamp(&task.payload);
                task.dedupe_key.map(|key| (key, stamp))
            })
            .collect();

        let mut remote_ids = HashSet::with_capacity(docs.len());
        let mut puts = Vec::new();
        for doc in docs {
            let incoming = Record::from_fields(doc.id, doc.fields);
            remote_ids.insert(incoming.id.clone());
            let key = dedupe_key(table, &incoming.id);

            let overridden = match ctx.pending.get(table, &incoming.id) {
                Some(change) if !change.is_stale_against(incoming.updated_at) => continue,
                Some(_) => {
                    debug!("Remote {}:{} supersedes pending change", table, incoming.id);
                    ctx.pending.remove(table, &incoming.id);
                    true
                }
                None => match queued.get(&key) {
                    Some(Some(stamp)) if *stamp >= incoming.updated_at => continue,
                    Some(Some(_)) => true,
                    _ => false,
                },
            };
            if overridden {
                ctx.queue.discard(&key)?;
            }

            let newer = local
                .get(&incoming.id)
                .is_none_or(|existing| incoming.is_newer_than(existing));
            if newer || overridden {
                puts.push(incoming);
            }
        }

        let protected = ctx.pending.ids_for(table);
        let deletions: Vec<String> = local
            .keys()
            .filter(|id| {
                !remote_ids.contains(*id)
                    && !protected.contains(*id)
                    && !queued.contains_key(&dedupe_key(table, id))
            })
            .cloned()
            .collect();

        if !puts.is_empty() || !deletions.is_empty() {
            debug!(
                "Applying {} upserts and {} deletions to {}",
                puts.len(),
                deletions.len(),
                table
            );
        }
        chunked_bulk_put(
            ctx.local.as_ref(),
            ctx.scheduler.as_ref(),
            table,
            &puts,
            self.config.chunk_size,
        )
        .await?;
        chunked_bulk_delete(
            ctx.local.as_ref(),
            ctx.scheduler.as_ref(),
            table,
            &deletions,
            self.config.chunk_size,
        )
        .await?;

        self.read_local().await
    }

    async fn read_local(&self) -> SyncResult<Vec<Record>> {
        chunked_to_array(
            self.ctx.local.as_ref(),
            self.ctx.scheduler.as_ref(),
            &self.config.entity_type,
            self.config.chunk_size,
            self.config.order_field.as_deref(),
            self.config.reverse,
        )
        .await
    }

    fn report(&self, error: SyncError) {
        (self.on_error)(error);
    }
}

/// Records `entry` and reports whether its stamp differs from the last one
/// seen. An absent entry is never a change.
fn observe(last_seen: &mut Option<RegistryEntry>, entry: Option<RegistryEntry>) -> bool {
    let Some(entry) = entry else {
        return false;
    };
    let changed = last_seen
        .as_ref()
        .is_none_or(|seen| !seen.same_stamp(&entry));
    if changed {
        *last_seen = Some(entry);
    }
    changed
}

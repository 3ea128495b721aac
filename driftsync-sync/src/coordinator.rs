//! Local-first write path.
//!
//! A write lands in the local store first and is visible to reads as soon
//! as the call returns. It is then buffered as a pending change, persisted
//! as a deduplicated sync task, and a debounced background push is
//! scheduled. Network failures never reach the writer; local store failures
//! do.

use crate::chunk::chunked_to_array;
use crate::error::{SyncError, SyncResult};
use crate::pending::PendingChanges;
use crate::processor::DeletePayload;
use crate::push::PushScheduler;
use crate::queue::{EnqueueOptions, SyncQueue};
use crate::scheduler::HostScheduler;
use driftsync_storage::LocalStore;
use driftsync_types::{Clock, Operation, PendingChange, Record, TaskType};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Queue key shared by every write to one record.
pub(crate) fn dedupe_key(entity_type: &str, id: &str) -> String {
    format!("{entity_type}:{id}")
}

pub struct LocalFirst {
    local: Arc<dyn LocalStore>,
    queue: SyncQueue,
    pending: Arc<PendingChanges>,
    push: PushScheduler,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn HostScheduler>,
    chunk_size: usize,
}

impl LocalFirst {
    pub fn new(
        local: Arc<dyn LocalStore>,
        queue: SyncQueue,
        pending: Arc<PendingChanges>,
        push: PushScheduler,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn HostScheduler>,
        chunk_size: usize,
    ) -> Self {
        Self {
            local,
            queue,
            pending,
            push,
            clock,
            scheduler,
            chunk_size,
        }
    }

    /// Applies a mutation locally and queues it for the remote.
    ///
    /// `create` needs `data`, `update` needs `diff`. An update of a record
    /// missing locally creates it from the diff. Returns the stored record,
    /// or `None` for a delete.
    pub fn write(
        &self,
        entity_type: &str,
        operation: Operation,
        id: &str,
        data: Option<Map<String, Value>>,
        diff: Option<Map<String, Value>>,
    ) -> SyncResult<Option<Record>> {
        if entity_type.is_empty() {
            return Err(SyncError::Validation("entity type must not be empty".into()));
        }
        if id.is_empty() {
            return Err(SyncError::Validation("id must not be empty".into()));
        }
        let now = self.clock.now_ms();
        let dedupe_key = dedupe_key(entity_type, id);

        let (record, change) = match operation {
            Operation::Create => {
                let data = data.ok_or_else(|| {
                    SyncError::Validation(format!("create of {dedupe_key} requires data"))
                })?;
                let mut record = Record::new(id, data.clone(), now);
                if let Some(existing) = self.local.get(entity_type, id)? {
                    record.created_at = existing.created_at;
                }
                let change = PendingChange {
                    id: id.to_string(),
                    entity_type: entity_type.to_string(),
                    operation,
                    data: Some(data),
                    diff: None,
                    timestamp: now,
                };
                (Some(record), change)
            }
            Operation::Update => {
                let diff = diff.ok_or_else(|| {
                    SyncError::Validation(format!("update of {dedupe_key} requires a diff"))
                })?;
                let (record, operation) = match self.local.get(entity_type, id)? {
                    Some(mut record) => {
                        record.apply_diff(&diff, now);
                        (record, Operation::Update)
                    }
                    None => {
                        debug!("{} not found locally; creating it from the diff", dedupe_key);
                        (Record::new(id, diff.clone(), now), Operation::Create)
                    }
                };
                let change = PendingChange {
                    id: id.to_string(),
                    entity_type: entity_type.to_string(),
                    operation,
                    data: Some(record.data.clone()),
                    diff: Some(diff),
                    timestamp: now,
                };
                (Some(record), change)
            }
            Operation::Delete => {
                let change = PendingChange {
                    id: id.to_string(),
                    entity_type: entity_type.to_string(),
                    operation,
                    data: None,
                    diff: None,
                    timestamp: now,
                };
                (None, change)
            }
        };

        let (task_type, payload) = match &record {
            Some(record) => {
                self.local.put(entity_type, record)?;
                (TaskType::upsert(entity_type), serde_json::to_value(record)?)
            }
            None => {
                self.local.delete(entity_type, id)?;
                let payload = DeletePayload {
                    id: id.to_string(),
                    deleted_at: now,
                };
                (TaskType::delete(entity_type), serde_json::to_value(payload)?)
            }
        };

        self.pending.record(change);
        self.queue
            .enqueue(task_type, payload, EnqueueOptions::deduped(dedupe_key))?;
        self.push.schedule();
        Ok(record)
    }

    pub fn create(&self, entity_type: &str, id: &str, data: Value) -> SyncResult<Record> {
        let data = into_object(data, "create data")?;
        self.write(entity_type, Operation::Create, id, Some(data), None)?
            .ok_or_else(|| SyncError::Storage(format!("create of {entity_type}:{id} stored nothing")))
    }

    pub fn update(&self, entity_type: &str, id: &str, diff: Value) -> SyncResult<Record> {
        let diff = into_object(diff, "update diff")?;
        self.write(entity_type, Operation::Update, id, None, Some(diff))?
            .ok_or_else(|| SyncError::Storage(format!("update of {entity_type}:{id} stored nothing")))
    }

    pub fn delete(&self, entity_type: &str, id: &str) -> SyncResult<()> {
        self.write(entity_type, Operation::Delete, id, None, None)?;
        Ok(())
    }

    /// Reads from the local store only. With an id, yields zero or one
    /// record; without, the whole table ordered by id.
    pub async fn read(&self, entity_type: &str, id: Option<&str>) -> SyncResult<Vec<Record>> {
        match id {
            Some(id) => Ok(self.local.get(entity_type, id)?.into_iter().collect()),
            None => {
                chunked_to_array(
                    self.local.as_ref(),
                    self.scheduler.as_ref(),
                    entity_type,
                    self.chunk_size,
                    None,
                    false,
                )
                .await
            }
        }
    }

    /// Pushes everything queued now instead of waiting for the debounce.
    pub async fn flush(&self) -> SyncResult<usize> {
        self.push.flush().await
    }

    /// Local changes not yet confirmed by the remote.
    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.pending.snapshot()
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }
}

fn into_object(value: Value, what: &str) -> SyncResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(SyncError::Validation(format!(
            "{what} must be an object, got {other}"
        ))),
    }
}

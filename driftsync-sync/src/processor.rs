//! Task processors that push entity changes to the remote store.
//!
//! One [`EntityProcessor`] per (entity type, task kind). Each commits its
//! data write together with a registry stamp for the entity's collection and
//! for every dependent collection, so listeners on any of them notice.

use crate::error::{SyncError, SyncResult};
use crate::pending::PendingChanges;
use crate::queue::TaskProcessor;
use crate::quota::QuotaGuard;
use crate::registry::ChangeRegistry;
use crate::remote::{RemoteStore, WriteBatch};
use async_trait::async_trait;
use driftsync_types::{Record, SyncTask, TaskKind, TaskType, UPDATED_AT_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

/// Maps a local entity type to its remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityBinding {
    /// Local table name and task type suffix.
    pub entity_type: String,
    /// Remote collection and registry key.
    pub collection: String,
    /// Collections whose listeners must also refetch after a write here.
    #[serde(default)]
    pub dependents: Vec<String>,
}

impl EntityBinding {
    pub fn new(entity_type: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            collection: collection.into(),
            dependents: Vec::new(),
        }
    }

    pub fn with_dependent(mut self, collection: impl Into<String>) -> Self {
        self.dependents.push(collection.into());
        self
    }

    /// The three task types served for this entity.
    pub fn task_types(&self) -> [TaskType; 3] {
        [
            TaskType::upsert(&self.entity_type),
            TaskType::update(&self.entity_type),
            TaskType::delete(&self.entity_type),
        ]
    }

    fn stamped_collections(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.collection.as_str()).chain(self.dependents.iter().map(String::as_str))
    }
}

/// Payload of an `update:<entity>` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub id: String,
    pub diff: Map<String, Value>,
    pub updated_at: i64,
}

/// Payload of a `delete:<entity>` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePayload {
    pub id: String,
    pub deleted_at: i64,
}

/// Time of the local write a task payload carries: `updatedAt` for upserts
/// and updates, `deletedAt` for deletes.
pub(crate) fn write_stamp(payload: &Value) -> Option<i64> {
    payload
        .get(UPDATED_AT_FIELD)
        .or_else(|| payload.get("deletedAt"))
        .and_then(Value::as_i64)
}

/// Pushes one kind of change for one entity binding.
pub struct EntityProcessor {
    kind: TaskKind,
    binding: EntityBinding,
    remote: Arc<dyn RemoteStore>,
    registry: ChangeRegistry,
    guard: Arc<QuotaGuard>,
    pending: Arc<PendingChanges>,
}

impl EntityProcessor {
    pub fn new(
        kind: TaskKind,
        binding: EntityBinding,
        remote: Arc<dyn RemoteStore>,
        registry: ChangeRegistry,
        guard: Arc<QuotaGuard>,
        pending: Arc<PendingChanges>,
    ) -> Self {
        Self {
            kind,
            binding,
            remote,
            registry,
            guard,
            pending,
        }
    }

    async fn commit(&self, mut batch: WriteBatch) -> SyncResult<()> {
        self.registry
            .stamp_into(&mut batch, self.binding.stamped_collections());
        self.guard
            .with_guard(async { self.remote.commit(batch).await.map_err(SyncError::from) })
            .await
    }

    async fn upsert(&self, record: Record) -> SyncResult<(String, i64)> {
        let mut batch = WriteBatch::new();
        batch.set(&self.binding.collection, &record.id, record.to_fields(), true);
        self.commit(batch).await?;
        Ok((record.id, record.updated_at))
    }

    async fn update(&self, payload: UpdatePayload) -> SyncResult<(String, i64)> {
        let mut fields = payload.diff;
        fields.insert(UPDATED_AT_FIELD.to_string(), Value::from(payload.updated_at));

        let mut batch = WriteBatch::new();
        batch.update(&self.binding.collection, &payload.id, fields.clone());
        match self.commit(batch).await {
            Err(SyncError::NotFound(_)) => {
                debug!(
                    "{}/{} missing remotely; merging update as a set",
                    self.binding.collection, payload.id
                );
                let mut batch = WriteBatch::new();
                batch.set(&self.binding.collection, &payload.id, fields, true);
                self.commit(batch).await?;
            }
            other => other?,
        }
        Ok((payload.id, payload.updated_at))
    }

    async fn delete(&self, payload: DeletePayload) -> SyncResult<(String, i64)> {
        let mut batch = WriteBatch::new();
        batch.delete(&self.binding.collection, &payload.id);
        match self.commit(batch).await {
            Err(SyncError::NotFound(_)) => {
                debug!("{}/{} already absent remotely", self.binding.collection, payload.id);
            }
            other => other?,
        }
        Ok((payload.id, payload.deleted_at))
    }
}

#[async_trait]
impl TaskProcessor for EntityProcessor {
    async fn process(&self, task: &SyncTask) -> SyncResult<()> {
        let payload = task.payload.clone();
        let (id, pushed_at) = match self.kind {
            TaskKind::Upsert => self.upsert(serde_json::from_value(payload)?).await?,
            TaskKind::Update => self.update(serde_json::from_value(payload)?).await?,
            TaskKind::Delete => self.delete(serde_json::from_value(payload)?).await?,
        };
        self.pending
            .settle(&self.binding.entity_type, &id, pushed_at);
        Ok(())
    }
}

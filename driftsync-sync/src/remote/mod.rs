//! Remote document store abstraction.
//!
//! The sync layer only needs a small slice of a hosted document database:
//! point reads, whole-collection listing, atomic write batches and a live
//! watch on a single document. [`RemoteStore`] is that slice; [`memory`]
//! provides an in-process implementation with fault injection.

pub mod memory;

use crate::error::SyncError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use thiserror::Error;

/// Error returned by a remote backend, carrying its status code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not-found", message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new("resource-exhausted", message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("unavailable", message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new("permission-denied", message)
    }

    /// Maps the backend code (or, failing that, the message) onto the sync
    /// error taxonomy.
    pub fn classify(&self) -> SyncError {
        let text = format!("{} {}", self.code, self.message).to_ascii_lowercase();
        let detail = self.to_string();
        if text.contains("resource-exhausted") || text.contains("quota") {
            SyncError::QuotaExceeded(detail)
        } else if text.contains("unavailable") {
            SyncError::RemoteUnavailable(detail)
        } else if text.contains("permission-denied") || text.contains("unauthenticated") {
            SyncError::Permission(detail)
        } else if text.contains("not-found") {
            SyncError::NotFound(detail)
        } else {
            SyncError::Transient(detail)
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        e.classify()
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// A document snapshot: id plus flattened fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// One write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Create or overwrite; with `merge` only the given fields change.
    Set {
        collection: String,
        id: String,
        fields: Map<String, Value>,
        merge: bool,
    },
    /// Change fields of an existing document. Fails with `not-found` if the
    /// document is absent, failing the whole batch.
    Update {
        collection: String,
        id: String,
        fields: Map<String, Value>,
    },
    /// Remove a document. Removing an absent document succeeds.
    Delete { collection: String, id: String },
}

impl BatchOp {
    /// The `(collection, id)` this op writes.
    pub fn target(&self) -> (&str, &str) {
        match self {
            Self::Set { collection, id, .. }
            | Self::Update { collection, id, .. }
            | Self::Delete { collection, id } => (collection, id),
        }
    }
}

/// Ops committed atomically: either all apply or none do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: BatchOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn set(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        fields: Map<String, Value>,
        merge: bool,
    ) -> &mut Self {
        self.push(BatchOp::Set {
            collection: collection.into(),
            id: id.into(),
            fields,
            merge,
        })
    }

    pub fn update(
        &mut self,
        collection: impl Into<String>,
        id: impl Into<String>,
        fields: Map<String, Value>,
    ) -> &mut Self {
        self.push(BatchOp::Update {
            collection: collection.into(),
            id: id.into(),
            fields,
        })
    }

    pub fn delete(&mut self, collection: impl Into<String>, id: impl Into<String>) -> &mut Self {
        self.push(BatchOp::Delete {
            collection: collection.into(),
            id: id.into(),
        })
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Live snapshots of one document: the current state first, then one item
/// per change. `None` means the document does not exist.
pub type DocStream = BoxStream<'static, RemoteResult<Option<Document>>>;

/// Hosted document database as seen by the sync layer.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Reads one document.
    async fn get(&self, collection: &str, id: &str) -> RemoteResult<Option<Document>>;

    /// Reads every document in a collection.
    async fn list(&self, collection: &str) -> RemoteResult<Vec<Document>>;

    /// Applies a batch atomically.
    async fn commit(&self, batch: WriteBatch) -> RemoteResult<()>;

    /// Watches one document.
    async fn watch(&self, collection: &str, id: &str) -> RemoteResult<DocStream>;

    /// Single-op `set`.
    async fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        merge: bool,
    ) -> RemoteResult<()> {
        let mut batch = WriteBatch::new();
        batch.set(collection, id, fields, merge);
        self.commit(batch).await
    }

    /// Single-op `update`.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> RemoteResult<()> {
        let mut batch = WriteBatch::new();
        batch.update(collection, id, fields);
        self.commit(batch).await
    }

    /// Single-op `delete`.
    async fn delete(&self, collection: &str, id: &str) -> RemoteResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(collection, id);
        self.commit(batch).await
    }
}

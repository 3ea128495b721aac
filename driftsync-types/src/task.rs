//! Sync tasks: the durable unit of outbound work.

use crate::TaskId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What a task does to its remote document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    /// Merge-set the full record.
    Upsert,
    /// Apply a field diff, falling back to a merge-set when absent remotely.
    Update,
    /// Remove the document; an already-absent document is success.
    Delete,
}

impl TaskKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A processor key: task kind plus entity type, e.g. `upsert:invoice`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskType {
    pub kind: TaskKind,
    pub entity: String,
}

impl TaskType {
    pub fn new(kind: TaskKind, entity: impl Into<String>) -> Self {
        Self {
            kind,
            entity: entity.into(),
        }
    }

    pub fn upsert(entity: impl Into<String>) -> Self {
        Self::new(TaskKind::Upsert, entity)
    }

    pub fn update(entity: impl Into<String>) -> Self {
        Self::new(TaskKind::Update, entity)
    }

    pub fn delete(entity: impl Into<String>) -> Self {
        Self::new(TaskKind::Delete, entity)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.entity)
    }
}

impl FromStr for TaskType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, entity) = s
            .split_once(':')
            .ok_or_else(|| crate::Error::InvalidTaskType(s.to_string()))?;
        if entity.is_empty() {
            return Err(crate::Error::InvalidTaskType(s.to_string()));
        }
        let kind = match kind {
            "upsert" => TaskKind::Upsert,
            "update" => TaskKind::Update,
            "delete" => TaskKind::Delete,
            _ => return Err(crate::Error::InvalidTaskType(s.to_string())),
        };
        Ok(Self::new(kind, entity))
    }
}

impl TryFrom<String> for TaskType {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.to_string()
    }
}

/// Lifecycle status of a persisted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::InvalidStatus(other.to_string())),
        }
    }
}

/// A durable, retryable outbound task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTask {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    /// Number of processing attempts so far. Never decreases.
    pub attempts: u32,
    pub status: TaskStatus,
    pub created_at: i64,
    pub last_tried_at: Option<i64>,
    pub last_error: Option<String>,
    pub next_retry_at: i64,
    pub dedupe_key: Option<String>,
}

impl SyncTask {
    /// Creates a fresh pending task that is due immediately.
    pub fn new(
        task_type: TaskType,
        payload: serde_json::Value,
        dedupe_key: Option<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            id: TaskId::new(),
            task_type,
            payload,
            attempts: 0,
            status: TaskStatus::Pending,
            created_at: now_ms,
            last_tried_at: None,
            last_error: None,
            next_retry_at: now_ms,
            dedupe_key,
        }
    }

    /// `next_retry_at` of a parked task: it has no scheduled retry and only
    /// an explicit re-enqueue brings it back.
    pub const PARKED: i64 = i64::MAX;

    /// Whether the task may be picked up at `now_ms`.
    #[must_use]
    pub fn is_due(&self, now_ms: i64) -> bool {
        match self.status {
            TaskStatus::Pending | TaskStatus::Failed => self.next_retry_at <= now_ms,
            TaskStatus::Processing => false,
        }
    }

    /// Marks the task failed with no scheduled retry.
    pub fn park(&mut self) {
        self.status = TaskStatus::Failed;
        self.next_retry_at = Self::PARKED;
    }

    /// Whether the task is parked as failed.
    #[must_use]
    pub fn is_parked(&self) -> bool {
        self.status == TaskStatus::Failed && self.next_retry_at == Self::PARKED
    }
}

/// Aggregate queue counts surfaced to the UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
}

impl QueueStats {
    /// Total number of tasks not yet delivered.
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.failed
    }
}

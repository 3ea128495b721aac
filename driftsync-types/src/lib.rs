//! Core type definitions for driftsync.
//!
//! This crate defines the storage-agnostic types shared by the local store,
//! the sync queue and the registry listener:
//! - Records (generic id-keyed entities with `createdAt`/`updatedAt`)
//! - Pending changes buffered by the write path
//! - Sync tasks and their typed task kinds
//! - Change registry entries
//! - Millisecond clocks (system and manual)
//!
//! Business payloads are opaque JSON objects; nothing here knows what a
//! record contains beyond its id and timestamps.

mod change;
mod clock;
mod ids;
mod record;
mod registry;
mod task;

pub use change::{Operation, PendingChange};
pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::TaskId;
pub use record::{Record, CREATED_AT_FIELD, UPDATED_AT_FIELD};
pub use registry::RegistryEntry;
pub use task::{QueueStats, SyncTask, TaskKind, TaskStatus, TaskType};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid task type: {0}")]
    InvalidTaskType(String),

    #[error("invalid task status: {0}")]
    InvalidStatus(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

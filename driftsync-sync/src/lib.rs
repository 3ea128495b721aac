//! Offline-first sync engine for driftsync.
//!
//! Local state is the source of truth for the UI; a hosted document store
//! is reconciled in the background.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **LocalFirst**: applies writes to the local store synchronously,
//!   buffers them as pending changes and queues them for upload
//! - **SyncQueue**: durable, deduplicated task queue with linear backoff,
//!   single-flight processing and stats subscriptions
//! - **EntityProcessor**: pushes one entity's changes, stamping the change
//!   registry in the same write batch
//! - **QuotaGuard**: circuit breaker that pauses remote work after quota or
//!   availability failures
//! - **ChangeRegistry / listeners**: each collection has a small beacon
//!   document; listeners watch it and fetch only when it changes
//! - **PullGate**: gates opportunistic reconciliation on user interaction
//!   and a cooldown
//!
//! ## Write path
//!
//! 1. **Local write**: the record is stored locally and readable at once
//! 2. **Enqueue**: a task keyed by `entityType:id` is persisted; a newer
//!    write to the same record replaces it
//! 3. **Push**: a debounced background drain (or an explicit flush) runs
//!    the queue
//! 4. **Stamp**: the data write and the registry stamp commit together
//!
//! ## Read path
//!
//! 1. **First paint**: listeners deliver the local table immediately
//! 2. **Watch**: the registry beacon is watched; identical rewrites are
//!    ignored
//! 3. **Reconcile**: a real change fetches the collection and merges it
//!    last-write-wins, keeping records with pending local changes
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use driftsync_storage::{QueueStore, SqliteStore};
//! use driftsync_sync::remote::memory::MemoryRemote;
//! use driftsync_sync::{EntityBinding, SyncConfig, SyncEngine};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SyncEngine::new(
//!     SyncConfig::default(),
//!     Arc::new(SqliteStore::open_in_memory()?),
//!     QueueStore::open_in_memory()?,
//!     Arc::new(MemoryRemote::new()),
//! )?;
//! engine.register_entity(EntityBinding::new("invoice", "invoices"));
//!
//! let record = engine
//!     .local_first()
//!     .create("invoice", "INV-1", json!({"amount": 120}))?;
//! assert_eq!(record.id, "INV-1");
//! assert_eq!(engine.queue().stats().pending, 1);
//! # Ok(())
//! # }
//! ```

pub mod chunk;
mod config;
mod coordinator;
mod engine;
mod error;
mod gate;
pub mod listener;
mod pending;
pub mod processor;
mod push;
pub mod queue;
mod quota;
pub mod registry;
pub mod remote;
pub mod scheduler;
mod subscription;

pub use chunk::{chunked_bulk_delete, chunked_bulk_put, chunked_to_array};
pub use config::{ListenerDefaults, QueueConfig, SyncConfig, MIN_POLL_INTERVAL};
pub use coordinator::LocalFirst;
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use gate::{InteractionEvent, PullGate};
pub use listener::{create_metadata_based_listener, ListenerConfig, ListenerContext};
pub use pending::PendingChanges;
pub use processor::{DeletePayload, EntityBinding, EntityProcessor, UpdatePayload};
pub use push::PushScheduler;
pub use queue::{processor_fn, EnqueueOptions, SyncQueue, TaskProcessor};
pub use quota::{QuotaGuard, DEFAULT_DISABLE_WINDOW};
pub use registry::{ChangeRegistry, REGISTRY_COLLECTION};
pub use remote::{BatchOp, Document, RemoteError, RemoteStore, WriteBatch};
pub use scheduler::{HostScheduler, TokioScheduler};
pub use subscription::Subscription;

#![allow(dead_code)]

use driftsync_storage::{LocalStore, QueueStore, SqliteStore};
use driftsync_sync::remote::memory::MemoryRemote;
use driftsync_sync::{SyncConfig, SyncEngine, TokioScheduler};
use driftsync_types::{ManualClock, Record};
use serde_json::{Map, Value};
use std::sync::Arc;

pub const START_MS: i64 = 1_000_000;

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub remote: Arc<MemoryRemote>,
    pub local: Arc<SqliteStore>,
    pub queue_store: QueueStore,
    pub engine: SyncEngine,
}

/// Engine on in-memory stores with a frozen clock. The background push
/// debounce is an hour so tests decide when the queue runs.
pub fn harness() -> Harness {
    harness_with(quiet_config())
}

pub fn quiet_config() -> SyncConfig {
    SyncConfig {
        push_debounce_ms: 60 * 60 * 1_000,
        ..SyncConfig::default()
    }
}

pub fn harness_with(config: SyncConfig) -> Harness {
    init_tracing();
    let clock = Arc::new(ManualClock::new(START_MS));
    let remote = Arc::new(MemoryRemote::new());
    let local = Arc::new(SqliteStore::open_in_memory().unwrap());
    let queue_store = QueueStore::open_in_memory().unwrap();
    let engine = SyncEngine::with_runtime(
        config,
        local.clone(),
        queue_store.clone(),
        remote.clone(),
        clock.clone(),
        Arc::new(TokioScheduler),
    )
    .unwrap();
    Harness {
        clock,
        remote,
        local,
        queue_store,
        engine,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn obj(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

pub fn record(id: &str, data: Value, updated_at: i64) -> Record {
    Record {
        id: id.to_string(),
        data: obj(data),
        created_at: updated_at,
        updated_at,
    }
}

/// Remote document fields for a record, as another client would write it.
pub fn remote_fields(data: Value, updated_at: i64) -> Map<String, Value> {
    record("unused", data, updated_at).to_fields()
}

pub fn local_ids(local: &dyn LocalStore, table: &str) -> Vec<String> {
    let mut ids = local.ids(table).unwrap();
    ids.sort();
    ids
}

//! In-memory buffer of local changes the remote has not confirmed.
//!
//! Listeners consult it during reconciliation: a record with a pending
//! change is never deleted locally and is only overwritten by a strictly
//! newer remote version.

use driftsync_types::PendingChange;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

type Key = (String, String);

#[derive(Debug, Default)]
pub struct PendingChanges {
    changes: Mutex<HashMap<Key, PendingChange>>,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, PendingChange>> {
        self.changes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a change, replacing any earlier one for the same record.
    pub fn record(&self, change: PendingChange) {
        self.lock().insert(change.key(), change);
    }

    pub fn get(&self, entity_type: &str, id: &str) -> Option<PendingChange> {
        self.lock()
            .get(&(entity_type.to_string(), id.to_string()))
            .cloned()
    }

    pub fn remove(&self, entity_type: &str, id: &str) -> Option<PendingChange> {
        self.lock().remove(&(entity_type.to_string(), id.to_string()))
    }

    /// Drops the change once a push carrying `pushed_at` (or later) has
    /// been confirmed. A newer local write stays pending.
    pub fn settle(&self, entity_type: &str, id: &str, pushed_at: i64) -> bool {
        let mut changes = self.lock();
        let key = (entity_type.to_string(), id.to_string());
        match changes.get(&key) {
            Some(change) if change.timestamp <= pushed_at => {
                changes.remove(&key);
                debug!("Settled pending change {}:{}", entity_type, id);
                true
            }
            _ => false,
        }
    }

    /// Ids of `entity_type` with a change in flight.
    pub fn ids_for(&self, entity_type: &str) -> HashSet<String> {
        self.lock()
            .keys()
            .filter(|(entity, _)| entity == entity_type)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Every buffered change.
    pub fn snapshot(&self) -> Vec<PendingChange> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

//! Change registry: one beacon document per logical collection.
//!
//! Writers add a registry stamp to the same batch as their data write, so
//! the beacon and the data commit together. Listeners watch only the beacon
//! and fetch the collection when its stamp changes, which keeps remote
//! reads proportional to real changes rather than to collection size.

use crate::error::{SyncError, SyncResult};
use crate::remote::{BatchOp, RemoteStore, WriteBatch};
use driftsync_types::{Clock, RegistryEntry};
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;

/// Remote collection holding the beacons, keyed by collection name.
pub const REGISTRY_COLLECTION: &str = "_registry";

#[derive(Clone)]
pub struct ChangeRegistry {
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
}

impl ChangeRegistry {
    pub fn new(remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>) -> Self {
        Self { remote, clock }
    }

    /// A fresh entry for `collection`, stamped now with a random trigger.
    pub fn stamp(&self, collection: &str) -> RegistryEntry {
        RegistryEntry::new(collection, self.clock.now_ms(), new_trigger())
    }

    /// The merge-set that re-stamps `collection`, for inclusion in a batch.
    pub fn stamp_op(&self, collection: &str) -> BatchOp {
        BatchOp::Set {
            collection: REGISTRY_COLLECTION.to_string(),
            id: collection.to_string(),
            fields: self.stamp(collection).to_fields(),
            merge: true,
        }
    }

    /// Adds a stamp for each collection to `batch`.
    pub fn stamp_into<'a>(
        &self,
        batch: &mut WriteBatch,
        collections: impl IntoIterator<Item = &'a str>,
    ) {
        for collection in collections {
            batch.push(self.stamp_op(collection));
        }
    }

    /// Re-stamps `collection` on its own.
    pub async fn touch(&self, collection: &str) -> SyncResult<RegistryEntry> {
        let entry = self.stamp(collection);
        self.remote
            .set(REGISTRY_COLLECTION, collection, entry.to_fields(), true)
            .await?;
        Ok(entry)
    }

    /// Reads the current beacon; `None` before the first write.
    pub async fn entry(&self, collection: &str) -> SyncResult<Option<RegistryEntry>> {
        let doc = self.remote.get(REGISTRY_COLLECTION, collection).await?;
        Ok(doc.map(|doc| RegistryEntry::from_fields(collection, &doc.fields)))
    }

    /// Live beacon snapshots for `collection`.
    pub async fn watch(
        &self,
        collection: &str,
    ) -> SyncResult<BoxStream<'static, SyncResult<Option<RegistryEntry>>>> {
        let owned = collection.to_string();
        let stream = self.remote.watch(REGISTRY_COLLECTION, collection).await?;
        Ok(stream
            .map(move |item| {
                item.map(|doc| doc.map(|doc| RegistryEntry::from_fields(owned.clone(), &doc.fields)))
                    .map_err(SyncError::from)
            })
            .boxed())
    }
}

fn new_trigger() -> String {
    format!("{:016x}", rand::random::<u64>())
}

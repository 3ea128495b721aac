//! In-process [`RemoteStore`] for tests and offline development.
//!
//! Behaves like a hosted document database: batches are atomic, `update`
//! on a missing document fails, deleting a missing document succeeds, and
//! watchers see the current snapshot followed by every write. Failures can
//! be injected one-shot ([`MemoryRemote::fail_next`]) or until cleared
//! ([`MemoryRemote::set_offline`]).

use super::{BatchOp, DocStream, Document, RemoteError, RemoteResult, RemoteStore, WriteBatch};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

type DocKey = (String, String);

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<String, Map<String, Value>>>,
    watchers: HashMap<DocKey, watch::Sender<Option<Document>>>,
    injected: VecDeque<RemoteError>,
    offline: Option<RemoteError>,
    list_calls: HashMap<String, usize>,
    get_calls: usize,
    commits: usize,
}

impl MemoryState {
    fn doc(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document::new(id, fields.clone()))
    }

    fn exists(&self, collection: &str, id: &str) -> bool {
        self.collections
            .get(collection)
            .is_some_and(|docs| docs.contains_key(id))
    }

    /// Consumes the next injected failure, or reports the offline error.
    fn take_failure(&mut self) -> Option<RemoteError> {
        self.injected.pop_front().or_else(|| self.offline.clone())
    }

    fn apply(&mut self, op: BatchOp) {
        match op {
            BatchOp::Set {
                collection,
                id,
                fields,
                merge,
            } => {
                let docs = self.collections.entry(collection).or_default();
                let doc = docs.entry(id).or_default();
                if !merge {
                    doc.clear();
                }
                doc.extend(fields);
            }
            BatchOp::Update {
                collection,
                id,
                fields,
            } => {
                if let Some(doc) = self
                    .collections
                    .get_mut(&collection)
                    .and_then(|docs| docs.get_mut(&id))
                {
                    doc.extend(fields);
                }
            }
            BatchOp::Delete { collection, id } => {
                if let Some(docs) = self.collections.get_mut(&collection) {
                    docs.remove(&id);
                }
            }
        }
    }

    fn notify(&self, collection: &str, id: &str) {
        if let Some(sender) = self.watchers.get(&(collection.to_string(), id.to_string())) {
            sender.send_replace(self.doc(collection, id));
        }
    }
}

/// Thread-safe in-memory document store.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails the next remote call with `error`. Calls queue up in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().injected.push_back(error);
    }

    /// Fails every remote call with `error` until called with `None`.
    pub fn set_offline(&self, error: Option<RemoteError>) {
        self.lock().offline = error;
    }

    /// Number of `list` calls made against `collection`.
    pub fn list_calls(&self, collection: &str) -> usize {
        self.lock().list_calls.get(collection).copied().unwrap_or(0)
    }

    /// Number of `get` calls made.
    pub fn get_calls(&self) -> usize {
        self.lock().get_calls
    }

    /// Number of successfully committed batches.
    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    /// Synchronous peek at a document, bypassing counters and faults.
    pub fn document(&self, collection: &str, id: &str) -> Option<Map<String, Value>> {
        self.lock().doc(collection, id).map(|doc| doc.fields)
    }

    /// Every document id in a collection, sorted.
    pub fn ids(&self, collection: &str) -> Vec<String> {
        self.lock()
            .collections
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Writes a document directly, as another client would, notifying
    /// watchers but bypassing counters and faults.
    pub fn put_document(&self, collection: &str, id: &str, fields: Map<String, Value>) {
        let mut state = self.lock();
        state.apply(BatchOp::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
            merge: false,
        });
        state.notify(collection, id);
    }

    /// Removes a document directly, notifying watchers.
    pub fn remove_document(&self, collection: &str, id: &str) {
        let mut state = self.lock();
        state.apply(BatchOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        state.notify(collection, id);
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(&self, collection: &str, id: &str) -> RemoteResult<Option<Document>> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        state.get_calls += 1;
        if let Some(err) = state.take_failure() {
            return Err(err);
        }
        Ok(state.doc(collection, id))
    }

    async fn list(&self, collection: &str) -> RemoteResult<Vec<Document>> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        *state.list_calls.entry(collection.to_string()).or_default() += 1;
        if let Some(err) = state.take_failure() {
            return Err(err);
        }
        Ok(state
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(&self, batch: WriteBatch) -> RemoteResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if let Some(err) = state.take_failure() {
            return Err(err);
        }
        for op in batch.ops() {
            if let BatchOp::Update { collection, id, .. } = op {
                if !state.exists(collection, id) {
                    return Err(RemoteError::not_found(format!(
                        "no document to update: {collection}/{id}"
                    )));
                }
            }
        }

        let mut touched: Vec<DocKey> = Vec::with_capacity(batch.len());
        for op in batch.into_ops() {
            let (collection, id) = op.target();
            touched.push((collection.to_string(), id.to_string()));
            state.apply(op);
        }
        state.commits += 1;
        for (collection, id) in &touched {
            state.notify(collection, id);
        }
        Ok(())
    }

    async fn watch(&self, collection: &str, id: &str) -> RemoteResult<DocStream> {
        let mut state = self.lock();
        if let Some(err) = state.take_failure() {
            return Err(err);
        }
        let current = state.doc(collection, id);
        let receiver = state
            .watchers
            .entry((collection.to_string(), id.to_string()))
            .or_insert_with(|| watch::channel(current).0)
            .subscribe();

        let stream = futures::stream::unfold((receiver, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let snapshot = rx.borrow_and_update().clone();
            Some((Ok(snapshot), (rx, false)))
        });
        Ok(stream.boxed())
    }
}

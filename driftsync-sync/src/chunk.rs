//! Chunked bulk operations on the local store.
//!
//! Large writes and reads are split into fixed-size chunks with a host
//! yield between them, so a reconciliation of thousands of records never
//! blocks the executor for long.

use crate::error::{SyncError, SyncResult};
use crate::scheduler::HostScheduler;
use driftsync_storage::{LocalStore, OrderBy, OrderField};
use driftsync_types::Record;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Chunk size used when callers do not pick one.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Writes `records` in chunks, yielding between chunks.
pub async fn chunked_bulk_put(
    store: &dyn LocalStore,
    scheduler: &dyn HostScheduler,
    table: &str,
    records: &[Record],
    chunk_size: usize,
) -> SyncResult<()> {
    let mut chunks = records.chunks(chunk_size.max(1)).peekable();
    while let Some(chunk) = chunks.next() {
        store.bulk_put(table, chunk)?;
        if chunks.peek().is_some() {
            scheduler.yield_now().await;
        }
    }
    Ok(())
}

/// Deletes `ids` in chunks, yielding between chunks.
pub async fn chunked_bulk_delete(
    store: &dyn LocalStore,
    scheduler: &dyn HostScheduler,
    table: &str,
    ids: &[String],
    chunk_size: usize,
) -> SyncResult<()> {
    let mut chunks = ids.chunks(chunk_size.max(1)).peekable();
    while let Some(chunk) = chunks.next() {
        store.bulk_delete(table, chunk)?;
        if chunks.peek().is_some() {
            scheduler.yield_now().await;
        }
    }
    Ok(())
}

/// Reads a whole table, paging by `order_field` when it is larger than one
/// chunk.
///
/// Pages are fetched with an inclusive bound on the last seen value; rows
/// repeated across a page boundary are filtered by id. If paging stalls or
/// fails, the table is read in one plain unordered read instead.
pub async fn chunked_to_array(
    store: &dyn LocalStore,
    scheduler: &dyn HostScheduler,
    table: &str,
    chunk_size: usize,
    order_field: Option<&str>,
    reverse: bool,
) -> SyncResult<Vec<Record>> {
    let chunk_size = chunk_size.max(1);
    let order = OrderBy::new(
        order_field.map_or(OrderField::Id, OrderField::parse),
        reverse,
    );

    let total = store.count(table)?;
    if total <= chunk_size {
        return Ok(store.to_array(table, Some(&order))?);
    }

    match paginate(store, scheduler, table, &order, chunk_size, total).await {
        Ok(records) => Ok(records),
        Err(e) => {
            warn!("Paged read of {} failed ({}), falling back to a plain read", table, e);
            Ok(store.to_array(table, None)?)
        }
    }
}

async fn paginate(
    store: &dyn LocalStore,
    scheduler: &dyn HostScheduler,
    table: &str,
    order: &OrderBy,
    chunk_size: usize,
    total: usize,
) -> SyncResult<Vec<Record>> {
    let mut seen: HashSet<String> = HashSet::with_capacity(total);
    let mut records = Vec::with_capacity(total);
    let mut bound: Option<Value> = None;
    let mut pages = 0usize;

    loop {
        let page = store.range(table, order, bound.as_ref(), chunk_size)?;
        let full = page.len() == chunk_size;
        let last_value = page.last().map(|record| order.field.value_of(record));

        let before = records.len();
        for record in page {
            if seen.insert(record.id.clone()) {
                records.push(record);
            }
        }
        pages += 1;

        if !full {
            break;
        }
        if records.len() == before {
            return Err(SyncError::Storage(format!(
                "pagination stalled: more than {chunk_size} rows share one order value"
            )));
        }
        match last_value {
            Some(Value::Null) | None => {
                return Err(SyncError::Storage(
                    "pagination bound is null; order field missing on some rows".into(),
                ));
            }
            value => bound = value,
        }
        scheduler.yield_now().await;
    }

    if records.len() < total {
        return Err(SyncError::Storage(format!(
            "paged read returned {} of {} rows",
            records.len(),
            total
        )));
    }
    debug!("Read {} rows of {} in {} pages", records.len(), table, pages);
    Ok(records)
}

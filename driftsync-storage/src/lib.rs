//! SQLite storage layer for driftsync.
//!
//! Provides the durable on-device half of the sync system:
//!
//! - [`LocalStore`]: the table API the write path and listeners consume
//!   (`get`, `put`, `bulk_put`, `delete`, `bulk_delete`, ordered reads and
//!   cursor pages). [`SqliteStore`] implements it over a single `records`
//!   table partitioned by logical table name.
//! - [`QueueStore`]: the persisted sync task queue plus a small key/value
//!   metadata table (used for the quota guard deadline).
//!
//! Both stores open either a file (durable across restarts) or an in-memory
//! database for tests.

mod error;
mod local;
mod queue_store;
mod sqlite;

pub use error::{StorageError, StorageResult};
pub use local::{LocalStore, OrderBy, OrderField};
pub use queue_store::QueueStore;
pub use sqlite::SqliteStore;

use std::path::Path;

/// Open a SQLite connection with the pragmas every store expects.
///
/// WAL journaling keeps readers and the single writer from blocking each
/// other when the local store and the queue share a file.
pub fn open_sqlite(path: &Path) -> StorageResult<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

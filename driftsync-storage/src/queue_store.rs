//! Persistent storage for the sync task queue and sync metadata.
//!
//! Uses its own tables so queue state can live beside (or apart from) the
//! local record tables. Every method is a single statement or transaction;
//! callers never hold the connection across an await.

use crate::error::{StorageError, StorageResult};
use driftsync_types::{QueueStats, SyncTask, TaskId, TaskStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Persistent store for sync tasks backed by SQLite.
#[derive(Clone)]
pub struct QueueStore {
    conn: Arc<Mutex<Connection>>,
}

const TASK_COLUMNS: &str = "id, task_type, payload_json, attempts, status, created_at, \
     last_tried_at, last_error, next_retry_at, dedupe_key";

impl QueueStore {
    /// Opens (or creates) a queue store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_sqlite(path)?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory queue store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sync_tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_tried_at INTEGER,
                last_error TEXT,
                next_retry_at INTEGER NOT NULL,
                dedupe_key TEXT UNIQUE
            );

            CREATE INDEX IF NOT EXISTS idx_sync_tasks_due
                ON sync_tasks (status, next_retry_at, created_at);

            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    // ── Tasks ────────────────────────────────────────────────────

    /// Inserts a new task.
    pub fn insert(&self, task: &SyncTask) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT INTO sync_tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                task.id.to_string(),
                task.task_type.to_string(),
                serde_json::to_string(&task.payload)?,
                task.attempts,
                task.status.as_str(),
                task.created_at,
                task.last_tried_at,
                task.last_error,
                task.next_retry_at,
                task.dedupe_key,
            ],
        )?;
        Ok(())
    }

    /// Rewrites every mutable column of an existing task.
    /// Returns false if the task no longer exists.
    pub fn update(&self, task: &SyncTask) -> StorageResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sync_tasks SET task_type = ?2, payload_json = ?3, attempts = ?4, status = ?5,
                 last_tried_at = ?6, last_error = ?7, next_retry_at = ?8, dedupe_key = ?9
             WHERE id = ?1",
            params![
                task.id.to_string(),
                task.task_type.to_string(),
                serde_json::to_string(&task.payload)?,
                task.attempts,
                task.status.as_str(),
                task.last_tried_at,
                task.last_error,
                task.next_retry_at,
                task.dedupe_key,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Deletes a task. Deleting a missing task is not an error.
    pub fn delete(&self, id: &TaskId) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sync_tasks WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    /// Deletes the task holding a dedupe key. Returns whether one existed.
    pub fn delete_by_dedupe_key(&self, key: &str) -> StorageResult<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM sync_tasks WHERE dedupe_key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    /// Loads one task.
    pub fn get(&self, id: &TaskId) -> StorageResult<Option<SyncTask>> {
        self.query_one(
            &format!("SELECT {TASK_COLUMNS} FROM sync_tasks WHERE id = ?1"),
            &id.to_string(),
        )
    }

    /// Loads the task holding a dedupe key.
    pub fn find_by_dedupe_key(&self, key: &str) -> StorageResult<Option<SyncTask>> {
        self.query_one(
            &format!("SELECT {TASK_COLUMNS} FROM sync_tasks WHERE dedupe_key = ?1"),
            key,
        )
    }

    /// Tasks that may run at `now_ms`, in `(next_retry_at, created_at)` order.
    pub fn due(&self, now_ms: i64, limit: usize) -> StorageResult<Vec<SyncTask>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM sync_tasks
             WHERE status IN ('pending', 'failed') AND next_retry_at <= ?1
             ORDER BY next_retry_at ASC, created_at ASC, rowid ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![now_ms, limit as i64], read_row)?;
        collect_tasks(rows)
    }

    /// Earliest `next_retry_at` among pending tasks.
    pub fn next_retry_at(&self) -> StorageResult<Option<i64>> {
        let conn = self.conn()?;
        let next = conn.query_row(
            "SELECT MIN(next_retry_at) FROM sync_tasks WHERE status = 'pending'",
            [],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(next)
    }

    /// Every task, oldest first.
    pub fn all(&self) -> StorageResult<Vec<SyncTask>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM sync_tasks ORDER BY created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map([], read_row)?;
        collect_tasks(rows)
    }

    /// Counts tasks by status.
    pub fn stats(&self) -> StorageResult<QueueStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM sync_tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            match status.parse::<TaskStatus>()? {
                TaskStatus::Pending => stats.pending = count as usize,
                TaskStatus::Processing => stats.processing = count as usize,
                TaskStatus::Failed => stats.failed = count as usize,
            }
        }
        Ok(stats)
    }

    /// Resets tasks stranded in `processing` (by a crash mid-push) to
    /// `pending`, due at `now_ms`. Returns how many were reset.
    pub fn reset_processing(&self, now_ms: i64) -> StorageResult<usize> {
        let conn = self.conn()?;
        let reset = conn.execute(
            "UPDATE sync_tasks SET status = 'pending', next_retry_at = ?1 WHERE status = 'processing'",
            params![now_ms],
        )?;
        if reset > 0 {
            debug!("Reset {} interrupted sync tasks to pending", reset);
        }
        Ok(reset)
    }

    /// Moves every failed task back to `pending`, due at `now_ms`.
    pub fn revive_failed(&self, now_ms: i64) -> StorageResult<usize> {
        let conn = self.conn()?;
        let revived = conn.execute(
            "UPDATE sync_tasks SET status = 'pending', next_retry_at = ?1 WHERE status = 'failed'",
            params![now_ms],
        )?;
        Ok(revived)
    }

    fn query_one(&self, sql: &str, key: &str) -> StorageResult<Option<SyncTask>> {
        let conn = self.conn()?;
        let row = conn.query_row(sql, params![key], read_row).optional()?;
        row.map(decode_task).transpose()
    }

    // ── Metadata ─────────────────────────────────────────────────

    /// Reads a metadata value.
    pub fn meta_get(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Writes a metadata value.
    pub fn meta_set(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Removes a metadata value.
    pub fn meta_delete(&self, key: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sync_meta WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// Raw column values of one `sync_tasks` row.
struct TaskRow {
    id: String,
    task_type: String,
    payload_json: String,
    attempts: u32,
    status: String,
    created_at: i64,
    last_tried_at: Option<i64>,
    last_error: Option<String>,
    next_retry_at: i64,
    dedupe_key: Option<String>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        task_type: row.get(1)?,
        payload_json: row.get(2)?,
        attempts: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
        last_tried_at: row.get(6)?,
        last_error: row.get(7)?,
        next_retry_at: row.get(8)?,
        dedupe_key: row.get(9)?,
    })
}

fn decode_task(row: TaskRow) -> StorageResult<SyncTask> {
    Ok(SyncTask {
        id: TaskId::parse(&row.id)
            .map_err(|e| StorageError::InvalidData(format!("invalid task id {}: {e}", row.id)))?,
        task_type: row.task_type.parse()?,
        payload: serde_json::from_str(&row.payload_json)?,
        attempts: row.attempts,
        status: row.status.parse()?,
        created_at: row.created_at,
        last_tried_at: row.last_tried_at,
        last_error: row.last_error,
        next_retry_at: row.next_retry_at,
        dedupe_key: row.dedupe_key,
    })
}

fn collect_tasks(
    rows: impl Iterator<Item = rusqlite::Result<TaskRow>>,
) -> StorageResult<Vec<SyncTask>> {
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(decode_task(row?)?);
    }
    Ok(tasks)
}

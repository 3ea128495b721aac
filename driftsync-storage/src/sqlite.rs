//! SQLite-backed implementation of [`LocalStore`].
//!
//! All logical tables share one `records` table keyed by `(tbl, id)`. The
//! payload is stored as JSON text; `created_at`/`updated_at` are real
//! columns so ordering by them does not need JSON extraction.

use crate::error::{StorageError, StorageResult};
use crate::local::{LocalStore, OrderBy, OrderField};
use driftsync_types::Record;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Local table store backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_sqlite(path)?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                tbl TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tbl, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_updated
                ON records (tbl, updated_at);
            ",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO records (tbl, id, data_json, created_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5)";

const SELECT_COLUMNS: &str = "SELECT id, data_json, created_at, updated_at FROM records";

impl LocalStore for SqliteStore {
    fn get(&self, table: &str, id: &str) -> StorageResult<Option<Record>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE tbl = ?1 AND id = ?2"))?;
        let mut rows = stmt.query(params![table, id])?;
        match rows.next()? {
            Some(row) => Ok(Some(decode_row(row)?)),
            None => Ok(None),
        }
    }

    fn put(&self, table: &str, record: &Record) -> StorageResult<()> {
        let data_json = serde_json::to_string(&record.data)?;
        let conn = self.conn()?;
        conn.execute(
            UPSERT_SQL,
            params![table, record.id, data_json, record.created_at, record.updated_at],
        )?;
        Ok(())
    }

    fn bulk_put(&self, table: &str, records: &[Record]) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT_SQL)?;
            for record in records {
                let data_json = serde_json::to_string(&record.data)?;
                stmt.execute(params![
                    table,
                    record.id,
                    data_json,
                    record.created_at,
                    record.updated_at
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM records WHERE tbl = ?1 AND id = ?2",
            params![table, id],
        )?;
        Ok(())
    }

    fn bulk_delete(&self, table: &str, ids: &[String]) -> StorageResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM records WHERE tbl = ?1 AND id = ?2")?;
            for id in ids {
                stmt.execute(params![table, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn count(&self, table: &str) -> StorageResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE tbl = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn ids(&self, table: &str) -> StorageResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM records WHERE tbl = ?1")?;
        let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn to_array(&self, table: &str, order: Option<&OrderBy>) -> StorageResult<Vec<Record>> {
        let mut query = Query::new(table);
        if let Some(order) = order {
            let expr = query.order_expr(&order.field);
            query.order_by(&expr, order.reverse);
        }
        self.run(query)
    }

    fn range(
        &self,
        table: &str,
        order: &OrderBy,
        bound: Option<&Value>,
        limit: usize,
    ) -> StorageResult<Vec<Record>> {
        let mut query = Query::new(table);
        let expr = query.order_expr(&order.field);
        if let Some(bound) = bound {
            let placeholder = query.bind(json_to_sql(bound));
            let cmp = if order.reverse { "<=" } else { ">=" };
            query.sql.push_str(&format!(" AND {expr} {cmp} {placeholder}"));
        }
        query.order_by(&expr, order.reverse);
        let placeholder = query.bind(SqlValue::Integer(limit as i64));
        query.sql.push_str(&format!(" LIMIT {placeholder}"));
        self.run(query)
    }
}

impl SqliteStore {
    fn run(&self, query: Query) -> StorageResult<Vec<Record>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&query.sql)?;
        let mut rows = stmt.query(params_from_iter(query.params.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(decode_row(row)?);
        }
        Ok(records)
    }
}

/// Incrementally built SELECT with numbered placeholders.
struct Query {
    sql: String,
    params: Vec<SqlValue>,
}

impl Query {
    fn new(table: &str) -> Self {
        Self {
            sql: format!("{SELECT_COLUMNS} WHERE tbl = ?1"),
            params: vec![SqlValue::Text(table.to_string())],
        }
    }

    fn bind(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    fn order_expr(&mut self, field: &OrderField) -> String {
        match field {
            OrderField::Id => "id".to_string(),
            OrderField::CreatedAt => "created_at".to_string(),
            OrderField::UpdatedAt => "updated_at".to_string(),
            OrderField::Data(name) => {
                let path = self.bind(SqlValue::Text(format!("$.\"{name}\"")));
                format!("json_extract(data_json, {path})")
            }
        }
    }

    fn order_by(&mut self, expr: &str, reverse: bool) {
        let dir = if reverse { "DESC" } else { "ASC" };
        if expr == "id" {
            self.sql.push_str(&format!(" ORDER BY id {dir}"));
        } else {
            self.sql.push_str(&format!(" ORDER BY {expr} {dir}, id {dir}"));
        }
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn decode_row(row: &rusqlite::Row<'_>) -> StorageResult<Record> {
    let id: String = row.get(0)?;
    let data_json: String = row.get(1)?;
    let created_at: i64 = row.get(2)?;
    let updated_at: i64 = row.get(3)?;
    let data: Map<String, Value> = match serde_json::from_str(&data_json)? {
        Value::Object(map) => map,
        other => {
            return Err(StorageError::InvalidData(format!(
                "record {id} payload is not an object: {other}"
            )));
        }
    };
    Ok(Record {
        id,
        data,
        created_at,
        updated_at,
    })
}

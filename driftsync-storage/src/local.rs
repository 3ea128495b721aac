//! The local table API consumed by the sync layer.

use crate::error::StorageResult;
use driftsync_types::{Record, CREATED_AT_FIELD, UPDATED_AT_FIELD};
use serde_json::Value;

/// Field a table read is ordered by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderField {
    Id,
    CreatedAt,
    UpdatedAt,
    /// A top-level field of the record payload.
    Data(String),
}

impl OrderField {
    /// Maps a field name to an order field; `id`, `createdAt` and
    /// `updatedAt` address the record columns, anything else the payload.
    pub fn parse(name: &str) -> Self {
        match name {
            "id" => Self::Id,
            CREATED_AT_FIELD => Self::CreatedAt,
            UPDATED_AT_FIELD => Self::UpdatedAt,
            other => Self::Data(other.to_string()),
        }
    }

    /// The value of this field on `record`, used as a pagination cursor.
    pub fn value_of(&self, record: &Record) -> Value {
        match self {
            Self::Id => Value::from(record.id.clone()),
            Self::CreatedAt => Value::from(record.created_at),
            Self::UpdatedAt => Value::from(record.updated_at),
            Self::Data(field) => record.data.get(field).cloned().unwrap_or(Value::Null),
        }
    }
}

/// Ordering of a table read. Ties are always broken by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: OrderField,
    pub reverse: bool,
}

impl OrderBy {
    pub fn new(field: OrderField, reverse: bool) -> Self {
        Self { field, reverse }
    }

    /// Ascending by id.
    pub fn id() -> Self {
        Self::new(OrderField::Id, false)
    }
}

/// Durable id-keyed tables.
///
/// Implementations are synchronous: the write path applies local mutations
/// before any network exchange and reports failures to the caller directly.
pub trait LocalStore: Send + Sync {
    /// Reads one record.
    fn get(&self, table: &str, id: &str) -> StorageResult<Option<Record>>;

    /// Inserts or replaces one record.
    fn put(&self, table: &str, record: &Record) -> StorageResult<()>;

    /// Inserts or replaces many records in one transaction.
    fn bulk_put(&self, table: &str, records: &[Record]) -> StorageResult<()>;

    /// Deletes one record; deleting a missing id is not an error.
    fn delete(&self, table: &str, id: &str) -> StorageResult<()>;

    /// Deletes many records in one transaction.
    fn bulk_delete(&self, table: &str, ids: &[String]) -> StorageResult<()>;

    /// Number of records in a table.
    fn count(&self, table: &str) -> StorageResult<usize>;

    /// All ids in a table.
    fn ids(&self, table: &str) -> StorageResult<Vec<String>>;

    /// All records, optionally ordered. `None` means storage order.
    fn to_array(&self, table: &str, order: Option<&OrderBy>) -> StorageResult<Vec<Record>>;

    /// One page of records in `order`, starting at `bound` inclusive:
    /// values `>= bound` ascending, or `<= bound` when `order.reverse`.
    fn range(
        &self,
        table: &str,
        order: &OrderBy,
        bound: Option<&Value>,
        limit: usize,
    ) -> StorageResult<Vec<Record>>;
}

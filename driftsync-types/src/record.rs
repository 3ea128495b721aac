//! Generic id-keyed records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name carrying the creation stamp in a flattened document.
pub const CREATED_AT_FIELD: &str = "createdAt";
/// Field name carrying the last-modification stamp in a flattened document.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// A business entity as stored locally.
///
/// The payload is an opaque JSON object. `created_at` and `updated_at` are
/// stamped by the write path; `updated_at` is the version used for
/// last-write-wins comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub data: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Record {
    /// Creates a record with both stamps set to `now_ms`.
    pub fn new(id: impl Into<String>, data: Map<String, Value>, now_ms: i64) -> Self {
        Self {
            id: id.into(),
            data,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Shallow-merges `diff` into the payload and bumps `updated_at`.
    pub fn apply_diff(&mut self, diff: &Map<String, Value>, now_ms: i64) {
        for (key, value) in diff {
            self.data.insert(key.clone(), value.clone());
        }
        self.updated_at = now_ms;
    }

    /// Last-write-wins: true when `self` is strictly newer than `other`.
    ///
    /// Whole-record granularity. Two devices editing different fields of the
    /// same record concurrently will keep only the later record.
    #[must_use]
    pub fn is_newer_than(&self, other: &Record) -> bool {
        self.updated_at > other.updated_at
    }

    /// Flattens the record into document fields (payload plus stamps).
    #[must_use]
    pub fn to_fields(&self) -> Map<String, Value> {
        let mut fields = self.data.clone();
        fields.insert(CREATED_AT_FIELD.to_string(), Value::from(self.created_at));
        fields.insert(UPDATED_AT_FIELD.to_string(), Value::from(self.updated_at));
        fields
    }

    /// Rebuilds a record from flattened document fields.
    ///
    /// Missing stamps default to 0 so documents written by older clients
    /// always lose a last-write-wins comparison against stamped local data.
    pub fn from_fields(id: impl Into<String>, mut fields: Map<String, Value>) -> Self {
        let created_at = fields
            .remove(CREATED_AT_FIELD)
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let updated_at = fields
            .remove(UPDATED_AT_FIELD)
            .and_then(|v| v.as_i64())
            .unwrap_or(created_at);
        Self {
            id: id.into(),
            data: fields,
            created_at,
            updated_at,
        }
    }
}

//! Change registry entries.
//!
//! Each logical collection owns one small beacon document. Writers re-stamp
//! it in the same batch as their data write; listeners watch only the beacon.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The beacon for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub collection: String,
    pub last_changed_at: i64,
    /// Random nonce so two stamps in the same millisecond still differ.
    pub trigger: String,
}

impl RegistryEntry {
    pub const LAST_CHANGED_AT_FIELD: &'static str = "lastChangedAt";
    pub const TRIGGER_FIELD: &'static str = "trigger";

    pub fn new(collection: impl Into<String>, last_changed_at: i64, trigger: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            last_changed_at,
            trigger: trigger.into(),
        }
    }

    /// Document fields written for this entry.
    #[must_use]
    pub fn to_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(
            Self::LAST_CHANGED_AT_FIELD.to_string(),
            Value::from(self.last_changed_at),
        );
        fields.insert(
            Self::TRIGGER_FIELD.to_string(),
            Value::from(self.trigger.clone()),
        );
        fields
    }

    /// Reads an entry back from document fields; missing values read as empty.
    #[must_use]
    pub fn from_fields(collection: impl Into<String>, fields: &Map<String, Value>) -> Self {
        Self {
            collection: collection.into(),
            last_changed_at: fields
                .get(Self::LAST_CHANGED_AT_FIELD)
                .and_then(Value::as_i64)
                .unwrap_or(0),
            trigger: fields
                .get(Self::TRIGGER_FIELD)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// True when `other` carries the same stamp (a no-op rewrite).
    #[must_use]
    pub fn same_stamp(&self, other: &RegistryEntry) -> bool {
        self.last_changed_at == other.last_changed_at && self.trigger == other.trigger
    }
}

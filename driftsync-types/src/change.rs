//! Pending changes buffered by the local-first write path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// A local mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for Operation {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(crate::Error::InvalidOperation(other.to_string())),
        }
    }
}

/// A local change that has not been confirmed by the remote store yet.
///
/// There is at most one per `(entity_type, id)`; a newer local write
/// replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub id: String,
    pub entity_type: String,
    pub operation: Operation,
    pub data: Option<Map<String, Value>>,
    pub diff: Option<Map<String, Value>>,
    /// Local write time, compared against incoming remote `updatedAt`.
    pub timestamp: i64,
}

impl PendingChange {
    /// The `(entity_type, id)` key this change is buffered under.
    #[must_use]
    pub fn key(&self) -> (String, String) {
        (self.entity_type.clone(), self.id.clone())
    }

    /// A remote version supersedes this change only when strictly newer.
    #[must_use]
    pub fn is_stale_against(&self, remote_updated_at: i64) -> bool {
        remote_updated_at > self.timestamp
    }
}

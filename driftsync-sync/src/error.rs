//! Error types for the sync layer.

use driftsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// Cloneable so one single-flight queue run can hand the same outcome to
/// every caller that joined it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Caller passed an unusable argument (missing data, empty id).
    #[error("validation error: {0}")]
    Validation(String),

    /// The remote document an update targeted does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Remote backend is unreachable or refusing service.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Remote backend rejected the request for quota or rate reasons.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Remote backend denied access. Retrying will not help.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Any other remote failure worth retrying.
    #[error("transient error: {0}")]
    Transient(String),

    /// Local storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Lowercase fragments that mark an error as quota/availability class.
const QUOTA_MARKERS: [&str; 3] = ["resource-exhausted", "quota", "unavailable"];

impl SyncError {
    /// True for errors that should trip the quota guard.
    ///
    /// Typed variants are recognised directly; anything else is matched by
    /// message substring so untyped backend failures are classified too.
    pub fn is_quota_class(&self) -> bool {
        match self {
            Self::QuotaExceeded(_) | Self::RemoteUnavailable(_) => true,
            Self::Transient(msg) => {
                let msg = msg.to_ascii_lowercase();
                QUOTA_MARKERS.iter().any(|marker| msg.contains(marker))
            }
            _ => false,
        }
    }

    /// False for errors that will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Permission(_) | Self::Validation(_) | Self::Serialization(_)
        )
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

//! Error types for warren-api.

use crate::ObjectKey;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by an [`ObjectStore`](crate::ObjectStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },

    /// Object with the same name already exists
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },

    /// Write was based on a stale resource version
    #[error("conflict writing {kind} {key}: expected resource version {expected}, found {actual}")]
    Conflict {
        kind: String,
        key: ObjectKey,
        /// Version the writer observed
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// Object was replaced by another one with the same name
    #[error("conflict deleting {kind} {key}: expected uid {expected}, found {actual}")]
    UidMismatch {
        kind: String,
        key: ObjectKey,
        expected: String,
        actual: String,
    },

    /// Kind is not registered with the store
    #[error("kind {0:?} is not registered")]
    UnknownKind(String),

    /// Object was decoded as the wrong kind
    #[error("expected kind {expected}, got {actual}")]
    KindMismatch { expected: String, actual: String },

    /// Object is malformed
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Object already has a different controller
    #[error("{child} is already controlled by {owner}")]
    AlreadyOwned { child: String, owner: String },

    /// Backend is temporarily unavailable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::UidMismatch { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }
}

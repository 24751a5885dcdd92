//! Error types for cachedb core.

use crate::model::{EntityKind, Field};
use crate::types::EntityId;
use std::io;
use thiserror::Error;

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the store, the journal, and domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A domain invariant would be violated. Nothing was mutated.
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong.
        message: String,
    },

    /// The durability write failed. The changes stay pending for retry.
    #[error("commit failed ({pending} changes still pending): {message}")]
    CommitFailure {
        /// Underlying failure.
        message: String,
        /// Number of changes returned to the pending set.
        pending: usize,
    },

    /// A stored attribute blob could not be decoded.
    #[error("corrupt attribute {field}: {reason}")]
    CorruptAttribute {
        /// The affected field.
        field: Field,
        /// Decoder diagnostic.
        reason: String,
    },

    /// The journal cannot be read. The caller decides whether to wipe or abort.
    #[error("store unavailable: {message}")]
    StoreUnavailable {
        /// Why recovery stopped.
        message: String,
    },

    /// No live entity with this id and kind.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Expected kind.
        kind: EntityKind,
        /// Requested id.
        id: EntityId,
    },

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    StoreLocked,

    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] cachedb_storage::StorageError),

    /// CBOR codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] cachedb_codec::CodecError),

    /// Filesystem failure outside the backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Creates a [`CoreError::Validation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a [`CoreError::StoreUnavailable`] error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// True for failures where retrying the same commit may succeed.
    pub fn is_commit_failure(&self) -> bool {
        matches!(self, Self::CommitFailure { .. })
    }

    /// Rebuilds an equivalent error for fan-out to several waiters.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::CommitFailure { message, pending } => Self::CommitFailure {
                message: message.clone(),
                pending: *pending,
            },
            Self::Validation { message } => Self::validation(message.clone()),
            Self::StoreLocked => Self::StoreLocked,
            Self::NotFound { kind, id } => Self::NotFound { kind: *kind, id: *id },
            other => Self::unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_pending_count() {
        let err = CoreError::CommitFailure {
            message: "disk full".into(),
            pending: 3,
        };
        assert_eq!(
            err.to_string(),
            "commit failed (3 changes still pending): disk full"
        );
        assert!(err.is_commit_failure());
        assert!(err.duplicate().is_commit_failure());
    }

    #[test]
    fn not_found_names_kind() {
        let id = EntityId::new();
        let err = CoreError::NotFound {
            kind: EntityKind::StorageBox,
            id,
        };
        assert!(err.to_string().starts_with("box "));
    }
}

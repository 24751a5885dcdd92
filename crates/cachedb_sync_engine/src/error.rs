//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote could not be reached or failed the request.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote sent something that does not decode or does not make sense.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local store failure during sync.
    #[error("store error: {0}")]
    Core(#[from] cachedb_core::CoreError),

    /// Sync was cancelled. No cursor moved past the last completed page.
    #[error("sync cancelled")]
    Cancelled,

    /// The persisted sync flag is off.
    #[error("sync is disabled")]
    Disabled,

    /// Another sync operation is in progress.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Core(err) => err.is_commit_failure(),
            _ => false,
        }
    }
}

impl From<cachedb_codec::CodecError> for SyncError {
    fn from(err: cachedb_codec::CodecError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("zone not found").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Disabled.is_retryable());
        assert!(!SyncError::Protocol("bad batch".into()).is_retryable());
    }

    #[test]
    fn codec_errors_become_protocol_errors() {
        let err: SyncError = cachedb_codec::CodecError::shape("missing seq").into();
        assert!(matches!(err, SyncError::Protocol(_)));
        assert!(err.to_string().contains("missing seq"));
    }
}

//! Codec errors.

use thiserror::Error;

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Failures while encoding or decoding CBOR.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the value was complete.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// Input was not well-formed CBOR.
    #[error("malformed CBOR: {message}")]
    Malformed {
        /// Parser diagnostic.
        message: String,
    },

    /// Input was well-formed but not in deterministic form.
    #[error("non-canonical encoding")]
    NonCanonical,

    /// Floats are never accepted.
    #[error("float values are forbidden")]
    FloatForbidden,

    /// A tag other than decimal fraction was present.
    #[error("unsupported tag {tag}")]
    UnsupportedTag {
        /// The rejected tag number.
        tag: u64,
    },

    /// An integer did not fit in i64.
    #[error("integer out of range")]
    IntegerOverflow,

    /// A map contained the same key twice.
    #[error("duplicate map key")]
    DuplicateKey,

    /// A decimal was malformed.
    #[error("invalid decimal: {message}")]
    InvalidDecimal {
        /// What was wrong with it.
        message: String,
    },

    /// A decoded value did not have the expected shape.
    #[error("unexpected shape: {message}")]
    Shape {
        /// Description of the mismatch.
        message: String,
    },
}

impl CodecError {
    /// Creates a [`CodecError::Shape`] error.
    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape {
            message: message.into(),
        }
    }

    /// Creates a [`CodecError::InvalidDecimal`] error.
    pub fn invalid_decimal(message: impl Into<String>) -> Self {
        Self::InvalidDecimal {
            message: message.into(),
        }
    }
}

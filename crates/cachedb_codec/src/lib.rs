//! # cachedb codec
//!
//! Deterministic CBOR for journal frames, field values, and sync batches.
//!
//! - [`Value`] is the dynamic tree; it has no float variant. Decimal
//!   quantities use [`Decimal`] carried as CBOR tag 4.
//! - [`to_canonical_cbor`] always emits the same bytes for equal values.
//! - [`from_cbor`] accepts only input that is already canonical, so a
//!   malformed or hand-crafted blob is rejected instead of coerced.
//!
//! ```
//! use cachedb_codec::{from_cbor, to_canonical_cbor, Decimal, Value};
//!
//! let weight = Value::Decimal("2.75".parse().unwrap());
//! let bytes = to_canonical_cbor(&weight);
//! assert_eq!(from_cbor(&bytes).unwrap(), weight);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decimal;
mod decoder;
mod encoder;
mod error;
mod value;

pub use decimal::Decimal;
pub use decoder::from_cbor;
pub use encoder::{to_canonical_cbor, DECIMAL_TAG};
pub use error::{CodecError, CodecResult};
pub use value::Value;

/// Types with a canonical CBOR form.
pub trait Encode {
    /// The value tree for `self`.
    fn to_value(&self) -> Value;

    /// Canonical bytes for `self`.
    fn encode(&self) -> Vec<u8> {
        to_canonical_cbor(&self.to_value())
    }
}

/// Types that can be rebuilt from canonical CBOR.
pub trait Decode: Sized {
    /// Rebuilds `Self` from a value tree.
    ///
    /// # Errors
    ///
    /// Fails with [`CodecError::Shape`] when the tree is not what `Self`
    /// expects.
    fn from_value(value: &Value) -> CodecResult<Self>;

    /// Decodes canonical bytes into `Self`.
    ///
    /// # Errors
    ///
    /// Fails if the bytes are not canonical CBOR or have the wrong shape.
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        Self::from_value(&from_cbor(bytes)?)
    }
}

impl Encode for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl Decode for Value {
    fn from_value(value: &Value) -> CodecResult<Self> {
        Ok(value.clone())
    }
}

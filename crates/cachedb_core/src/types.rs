//! Identifier and ordering types.

use cachedb_codec::{CodecError, CodecResult, Value};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            /// Parses a 16-byte slice.
            #[must_use]
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                Uuid::from_slice(bytes).ok().map(Self)
            }

            /// Raw bytes.
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// The id as a CBOR byte string.
            pub fn to_value(&self) -> Value {
                Value::Bytes(self.as_bytes().to_vec())
            }

            /// Reads an id from a CBOR byte string.
            ///
            /// # Errors
            ///
            /// Fails unless `value` is a 16-byte byte string.
            pub fn from_value(value: &Value) -> CodecResult<Self> {
                value
                    .as_bytes()
                    .and_then(Self::from_slice)
                    .ok_or_else(|| CodecError::shape(concat!("expected 16-byte ", stringify!($name))))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_newtype!(
    /// Stable identifier of an entity, shared by every device.
    EntityId
);

uuid_newtype!(
    /// Identifier of one installation of the store.
    DeviceId
);

impl DeviceId {
    /// The all-zero id, ordered before every generated id.
    pub const NIL: Self = Self::from_bytes([0; 16]);
}

/// Position of a committed local change in this device's history.
///
/// Sequence numbers start at 1; 0 means "nothing yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Nothing committed yet.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw value.
    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// The raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The following sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-field write stamp.
///
/// Stamps order by wall-clock milliseconds, then a logical counter that
/// separates writes within the same millisecond, then the writing device.
/// The device component makes the order total, so two devices that write
/// the same field at the same instant still agree on a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Stamp {
    /// UTC milliseconds since the Unix epoch.
    pub wall_ms: i64,
    /// Logical counter within `wall_ms`.
    pub counter: u32,
    /// Device that issued the stamp.
    pub device: DeviceId,
}

impl Stamp {
    /// Ordered before every issued stamp.
    pub const MIN: Self = Self {
        wall_ms: i64::MIN,
        counter: 0,
        device: DeviceId::NIL,
    };

    /// The wall-clock component as a UTC instant.
    #[must_use]
    pub fn instant(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.wall_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// `[wall_ms, counter, device]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Integer(self.wall_ms),
            Value::from(self.counter),
            self.device.to_value(),
        ])
    }

    /// Reads `[wall_ms, counter, device]`.
    ///
    /// # Errors
    ///
    /// Fails if `value` does not have that shape.
    pub fn from_value(value: &Value) -> CodecResult<Self> {
        let parts = value
            .as_array()
            .filter(|p| p.len() == 3)
            .ok_or_else(|| CodecError::shape("stamp must be a 3-element array"))?;
        let wall_ms = parts[0]
            .as_integer()
            .ok_or_else(|| CodecError::shape("stamp wall_ms"))?;
        let counter = parts[1]
            .as_integer()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| CodecError::shape("stamp counter"))?;
        let device = DeviceId::from_value(&parts[2])?;
        Ok(Self {
            wall_ms,
            counter,
            device,
        })
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.wall_ms, self.counter, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(b: u8) -> DeviceId {
        DeviceId::from_bytes([b; 16])
    }

    #[test]
    fn stamps_order_by_time_then_counter_then_device() {
        let a = Stamp { wall_ms: 10, counter: 5, device: device(9) };
        let b = Stamp { wall_ms: 11, counter: 0, device: device(1) };
        let c = Stamp { wall_ms: 11, counter: 1, device: device(1) };
        let d = Stamp { wall_ms: 11, counter: 1, device: device(2) };
        assert!(a < b && b < c && c < d);
        assert!(Stamp::MIN < a);
    }

    #[test]
    fn stamp_value_round_trip() {
        let s = Stamp { wall_ms: 1_700_000_000_000, counter: 3, device: device(4) };
        assert_eq!(Stamp::from_value(&s.to_value()).unwrap(), s);
        assert!(Stamp::from_value(&Value::Integer(1)).is_err());
    }

    #[test]
    fn ids_parse_and_print() {
        let id = EntityId::new();
        let parsed: EntityId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(EntityId::from_slice(&[1, 2, 3]).is_none());
        assert_eq!(EntityId::from_value(&id.to_value()).unwrap(), id);
    }

    #[test]
    fn sequence_numbers_step() {
        assert_eq!(SequenceNumber::ZERO.next().get(), 1);
    }

    #[test]
    fn instant_is_utc() {
        let s = Stamp { wall_ms: 0, counter: 0, device: DeviceId::NIL };
        assert_eq!(s.instant().to_rfc3339(), "1970-01-01T00:00:00+00:00");
    }
}

//! Batch rows.

use cachedb_codec::{CodecError, CodecResult, Decode, Encode, Value};

/// One field or relationship delta on the wire.
///
/// `new_value` is the canonical CBOR of the written value, opaque to the
/// transport. `wall_ms`, `counter` and `device_id` together form the write
/// stamp; `seq` is the originating device's sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncChange {
    /// Entity id (16 bytes).
    pub entity_id: [u8; 16],
    /// Entity kind name.
    pub entity_type: String,
    /// Field or relation written.
    pub field_or_relation: String,
    /// Canonical CBOR of the new value.
    pub new_value: Vec<u8>,
    /// Stamp wall clock, UTC milliseconds.
    pub wall_ms: i64,
    /// Stamp logical counter.
    pub counter: u32,
    /// Originating device (16 bytes).
    pub device_id: [u8; 16],
    /// Sequence number on the originating device.
    pub seq: u64,
}

pub(crate) fn uint(n: u64) -> Value {
    Value::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

pub(crate) fn id16(value: Option<&Value>, name: &str) -> CodecResult<[u8; 16]> {
    value
        .and_then(Value::as_bytes)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| CodecError::shape(format!("missing or malformed {name}")))
}

pub(crate) fn required<'a>(value: &'a Value, name: &str) -> CodecResult<&'a Value> {
    value
        .get(name)
        .ok_or_else(|| CodecError::shape(format!("missing {name}")))
}

pub(crate) fn required_u64(value: &Value, name: &str) -> CodecResult<u64> {
    required(value, name)?
        .as_u64()
        .ok_or_else(|| CodecError::shape(format!("{name} must be an unsigned integer")))
}

pub(crate) fn required_text(value: &Value, name: &str) -> CodecResult<String> {
    required(value, name)?
        .as_text()
        .map(str::to_owned)
        .ok_or_else(|| CodecError::shape(format!("{name} must be text")))
}

impl Encode for SyncChange {
    fn to_value(&self) -> Value {
        Value::record([
            ("entity_id", Value::Bytes(self.entity_id.to_vec())),
            ("entity_type", Value::from(self.entity_type.as_str())),
            ("field", Value::from(self.field_or_relation.as_str())),
            ("value", Value::Bytes(self.new_value.clone())),
            ("wall_ms", Value::Integer(self.wall_ms)),
            ("counter", Value::from(self.counter)),
            ("device_id", Value::Bytes(self.device_id.to_vec())),
            ("seq", uint(self.seq)),
        ])
    }
}

impl Decode for SyncChange {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let counter = required_u64(value, "counter")?;
        Ok(Self {
            entity_id: id16(value.get("entity_id"), "entity_id")?,
            entity_type: required_text(value, "entity_type")?,
            field_or_relation: required_text(value, "field")?,
            new_value: required(value, "value")?
                .as_bytes()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| CodecError::shape("value must be a byte string"))?,
            wall_ms: required(value, "wall_ms")?
                .as_integer()
                .ok_or_else(|| CodecError::shape("wall_ms must be an integer"))?,
            counter: u32::try_from(counter).map_err(|_| CodecError::IntegerOverflow)?,
            device_id: id16(value.get("device_id"), "device_id")?,
            seq: required_u64(value, "seq")?,
        })
    }
}

/// An ordered run of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    /// The changes, oldest first.
    pub changes: Vec<SyncChange>,
}

impl ChangeBatch {
    /// Wraps `changes`.
    pub fn new(changes: Vec<SyncChange>) -> Self {
        Self { changes }
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// True if there are no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Highest `seq` in the batch among changes from `device`.
    pub fn last_seq_from(&self, device: &[u8; 16]) -> Option<u64> {
        self.changes
            .iter()
            .filter(|c| &c.device_id == device)
            .map(|c| c.seq)
            .max()
    }
}

impl Encode for ChangeBatch {
    fn to_value(&self) -> Value {
        Value::record([(
            "changes",
            Value::Array(self.changes.iter().map(Encode::to_value).collect()),
        )])
    }
}

impl Decode for ChangeBatch {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let changes = required(value, "changes")?
            .as_array()
            .ok_or_else(|| CodecError::shape("changes must be an array"))?
            .iter()
            .map(SyncChange::from_value)
            .collect::<CodecResult<_>>()?;
        Ok(Self { changes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64) -> SyncChange {
        SyncChange {
            entity_id: [7; 16],
            entity_type: "item".into(),
            field_or_relation: "name".into(),
            new_value: cachedb_codec::to_canonical_cbor(&Value::from("Scarf")),
            wall_ms: 1_700_000_000_000,
            counter: 3,
            device_id: [1; 16],
            seq,
        }
    }

    #[test]
    fn batch_round_trip() {
        let batch = ChangeBatch::new(vec![sample(1), sample(2)]);
        assert_eq!(ChangeBatch::decode(&batch.encode()).unwrap(), batch);
        assert_eq!(batch.last_seq_from(&[1; 16]), Some(2));
        assert_eq!(batch.last_seq_from(&[2; 16]), None);
    }

    #[test]
    fn short_ids_are_rejected() {
        let mut value = sample(1).to_value();
        if let Value::Map(pairs) = &mut value {
            for (k, v) in pairs.iter_mut() {
                if k.as_text() == Some("entity_id") {
                    *v = Value::Bytes(vec![0; 15]);
                }
            }
        }
        assert!(SyncChange::from_value(&value).is_err());
    }

    #[test]
    fn oversized_counter_is_rejected() {
        let mut value = sample(1).to_value();
        if let Value::Map(pairs) = &mut value {
            for (k, v) in pairs.iter_mut() {
                if k.as_text() == Some("counter") {
                    *v = Value::Integer(i64::from(u32::MAX) + 1);
                }
            }
        }
        assert!(matches!(
            SyncChange::from_value(&value),
            Err(CodecError::IntegerOverflow)
        ));
    }
}

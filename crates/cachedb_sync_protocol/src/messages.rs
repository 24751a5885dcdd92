//! Protocol messages between a device and the remote zone.

use crate::change::{id16, required, required_text, required_u64, uint, ChangeBatch};
use cachedb_codec::{CodecError, CodecResult, Decode, Encode, Value};

/// Push a device's committed changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    /// Target zone.
    pub zone: String,
    /// Pushing device.
    pub device_id: [u8; 16],
    /// Changes, in sequence order.
    pub batch: ChangeBatch,
}

/// Server reply to a push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushAck {
    /// Changes newly stored.
    pub accepted: u64,
    /// Changes the zone already had.
    pub duplicates: u64,
    /// Highest sequence number from this device the zone now holds.
    pub acked_seq: u64,
    /// Zone cursor after the push.
    pub server_cursor: u64,
}

/// Ask for changes after a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    /// Source zone.
    pub zone: String,
    /// Exclusive lower bound.
    pub since: u64,
    /// Maximum number of changes to return.
    pub limit: u32,
}

/// Server reply to a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullResponse {
    /// Changes after the requested cursor, oldest first.
    pub batch: ChangeBatch,
    /// Cursor to send next time.
    pub new_cursor: u64,
    /// Whether more changes are waiting.
    pub has_more: bool,
}

/// Remove every record in a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraseRequest {
    /// Zone to erase.
    pub zone: String,
}

/// Server reply to an erase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraseAck {
    /// Zone erased.
    pub zone: String,
    /// Changes removed.
    pub erased: u64,
}

impl Encode for PushRequest {
    fn to_value(&self) -> Value {
        Value::record([
            ("zone", Value::from(self.zone.as_str())),
            ("device_id", Value::Bytes(self.device_id.to_vec())),
            ("batch", self.batch.to_value()),
        ])
    }
}

impl Decode for PushRequest {
    fn from_value(value: &Value) -> CodecResult<Self> {
        Ok(Self {
            zone: required_text(value, "zone")?,
            device_id: id16(value.get("device_id"), "device_id")?,
            batch: ChangeBatch::from_value(required(value, "batch")?)?,
        })
    }
}

impl Encode for PushAck {
    fn to_value(&self) -> Value {
        Value::record([
            ("accepted", uint(self.accepted)),
            ("duplicates", uint(self.duplicates)),
            ("acked_seq", uint(self.acked_seq)),
            ("server_cursor", uint(self.server_cursor)),
        ])
    }
}

impl Decode for PushAck {
    fn from_value(value: &Value) -> CodecResult<Self> {
        Ok(Self {
            accepted: required_u64(value, "accepted")?,
            duplicates: required_u64(value, "duplicates")?,
            acked_seq: required_u64(value, "acked_seq")?,
            server_cursor: required_u64(value, "server_cursor")?,
        })
    }
}

impl Encode for PullRequest {
    fn to_value(&self) -> Value {
        Value::record([
            ("zone", Value::from(self.zone.as_str())),
            ("since", uint(self.since)),
            ("limit", Value::from(self.limit)),
        ])
    }
}

impl Decode for PullRequest {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let limit = required_u64(value, "limit")?;
        Ok(Self {
            zone: required_text(value, "zone")?,
            since: required_u64(value, "since")?,
            limit: u32::try_from(limit).map_err(|_| CodecError::IntegerOverflow)?,
        })
    }
}

impl Encode for PullResponse {
    fn to_value(&self) -> Value {
        Value::record([
            ("batch", self.batch.to_value()),
            ("new_cursor", uint(self.new_cursor)),
            ("has_more", Value::Bool(self.has_more)),
        ])
    }
}

impl Decode for PullResponse {
    fn from_value(value: &Value) -> CodecResult<Self> {
        Ok(Self {
            batch: ChangeBatch::from_value(required(value, "batch")?)?,
            new_cursor: required_u64(value, "new_cursor")?,
            has_more: required(value, "has_more")?
                .as_bool()
                .ok_or_else(|| CodecError::shape("has_more must be a bool"))?,
        })
    }
}

impl Encode for EraseRequest {
    fn to_value(&self) -> Value {
        Value::record([("zone", Value::from(self.zone.as_str()))])
    }
}

impl Decode for EraseRequest {
    fn from_value(value: &Value) -> CodecResult<Self> {
        Ok(Self {
            zone: required_text(value, "zone")?,
        })
    }
}

impl Encode for EraseAck {
    fn to_value(&self) -> Value {
        Value::record([
            ("zone", Value::from(self.zone.as_str())),
            ("erased", uint(self.erased)),
        ])
    }
}

impl Decode for EraseAck {
    fn from_value(value: &Value) -> CodecResult<Self> {
        Ok(Self {
            zone: required_text(value, "zone")?,
            erased: required_u64(value, "erased")?,
        })
    }
}

/// Any protocol message, framed as `{type, body}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Push request.
    PushRequest(PushRequest),
    /// Push acknowledgement.
    PushAck(PushAck),
    /// Pull request.
    PullRequest(PullRequest),
    /// Pull response.
    PullResponse(PullResponse),
    /// Erase request.
    EraseRequest(EraseRequest),
    /// Erase acknowledgement.
    EraseAck(EraseAck),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::PushRequest(_) => 1,
            SyncMessage::PushAck(_) => 2,
            SyncMessage::PullRequest(_) => 3,
            SyncMessage::PullResponse(_) => 4,
            SyncMessage::EraseRequest(_) => 5,
            SyncMessage::EraseAck(_) => 6,
        }
    }

    fn body(&self) -> Value {
        match self {
            SyncMessage::PushRequest(m) => m.to_value(),
            SyncMessage::PushAck(m) => m.to_value(),
            SyncMessage::PullRequest(m) => m.to_value(),
            SyncMessage::PullResponse(m) => m.to_value(),
            SyncMessage::EraseRequest(m) => m.to_value(),
            SyncMessage::EraseAck(m) => m.to_value(),
        }
    }
}

impl Encode for SyncMessage {
    fn to_value(&self) -> Value {
        Value::record([
            ("type", Value::Integer(i64::from(self.type_code()))),
            ("body", self.body()),
        ])
    }
}

impl Decode for SyncMessage {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let body = required(value, "body")?;
        Ok(match required_u64(value, "type")? {
            1 => SyncMessage::PushRequest(PushRequest::from_value(body)?),
            2 => SyncMessage::PushAck(PushAck::from_value(body)?),
            3 => SyncMessage::PullRequest(PullRequest::from_value(body)?),
            4 => SyncMessage::PullResponse(PullResponse::from_value(body)?),
            5 => SyncMessage::EraseRequest(EraseRequest::from_value(body)?),
            6 => SyncMessage::EraseAck(EraseAck::from_value(body)?),
            other => return Err(CodecError::shape(format!("unknown message type {other}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::SyncChange;
    use proptest::prelude::*;

    fn push() -> PushRequest {
        PushRequest {
            zone: "inventory".into(),
            device_id: [9; 16],
            batch: ChangeBatch::new(vec![SyncChange {
                entity_id: [3; 16],
                entity_type: "tag".into(),
                field_or_relation: "$tombstone".into(),
                new_value: vec![0xa0],
                wall_ms: 5,
                counter: 0,
                device_id: [9; 16],
                seq: 12,
            }]),
        }
    }

    #[test]
    fn messages_survive_the_envelope() {
        let messages = [
            SyncMessage::PushRequest(push()),
            SyncMessage::PullResponse(PullResponse {
                batch: push().batch,
                new_cursor: 40,
                has_more: true,
            }),
            SyncMessage::EraseAck(EraseAck {
                zone: "inventory".into(),
                erased: 3,
            }),
        ];
        for message in messages {
            let bytes = message.encode();
            assert_eq!(SyncMessage::decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let value = Value::record([("type", Value::Integer(99)), ("body", Value::record::<&str>([]))]);
        assert!(SyncMessage::from_value(&value).is_err());
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = SyncMessage::decode(&bytes);
        }
    }
}

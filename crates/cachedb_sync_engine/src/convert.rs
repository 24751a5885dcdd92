//! Mapping between committed changes and batch rows.

use crate::error::{SyncError, SyncResult};
use cachedb_codec::{Decode, Encode, Value};
use cachedb_core::{Change, ChangeTarget, CommittedChange, DeviceId, EntityId, EntityKind, Stamp};
use cachedb_sync_protocol::SyncChange;

/// Builds the batch row for a committed local change.
pub fn to_sync(committed: &CommittedChange) -> SyncChange {
    let change = &committed.change;
    SyncChange {
        entity_id: *change.entity_id.as_bytes(),
        entity_type: change.kind.name().to_string(),
        field_or_relation: change.target.to_string(),
        new_value: change.new.encode(),
        wall_ms: change.stamp.wall_ms,
        counter: change.stamp.counter,
        device_id: *change.stamp.device.as_bytes(),
        seq: committed.seq.get(),
    }
}

/// Rebuilds a mergeable change from a batch row.
///
/// The previous value is local bookkeeping and never travels, so `old` is
/// always `None`.
///
/// # Errors
///
/// `Protocol` if the row names an unknown kind or target, or its value is
/// not canonical CBOR.
pub fn from_sync(row: &SyncChange) -> SyncResult<Change> {
    let kind = EntityKind::from_name(&row.entity_type)
        .ok_or_else(|| SyncError::Protocol(format!("unknown entity type {:?}", row.entity_type)))?;
    let target: ChangeTarget = row.field_or_relation.parse()?;
    Ok(Change {
        entity_id: EntityId::from_bytes(row.entity_id),
        kind,
        target,
        old: None,
        new: Value::decode(&row.new_value)?,
        stamp: Stamp {
            wall_ms: row.wall_ms,
            counter: row.counter,
            device: DeviceId::from_bytes(row.device_id),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachedb_core::{Field, RelationRole, SequenceNumber};

    fn committed(target: ChangeTarget, new: Value) -> CommittedChange {
        CommittedChange {
            seq: SequenceNumber::new(7),
            change: Change {
                entity_id: EntityId::new(),
                kind: EntityKind::Item,
                target,
                old: Some(Value::from("before")),
                new,
                stamp: Stamp {
                    wall_ms: 1_700_000_000_123,
                    counter: 2,
                    device: DeviceId::new(),
                },
            },
        }
    }

    #[test]
    fn rows_carry_everything_but_the_old_value() {
        let tag = EntityId::new();
        for (target, new) in [
            (ChangeTarget::Field(Field::Name), Value::from("Drill")),
            (ChangeTarget::Member(RelationRole::ItemTag, tag), Value::Bool(true)),
            (ChangeTarget::Link(RelationRole::ItemBox), Value::Null),
        ] {
            let local = committed(target, new);
            let row = to_sync(&local);
            assert_eq!(row.seq, 7);
            assert_eq!(row.entity_type, "item");

            let back = from_sync(&row).unwrap();
            assert_eq!(back.old, None);
            assert_eq!(back.target, local.change.target);
            assert_eq!(back.new, local.change.new);
            assert_eq!(back.stamp, local.change.stamp);
            assert_eq!(back.entity_id, local.change.entity_id);
        }
    }

    #[test]
    fn unknown_rows_are_protocol_errors() {
        let mut row = to_sync(&committed(ChangeTarget::Tombstone, Value::record::<&str>([])));
        row.entity_type = "shelf".into();
        assert!(matches!(from_sync(&row), Err(SyncError::Protocol(_))));

        let mut row = to_sync(&committed(ChangeTarget::Tombstone, Value::record::<&str>([])));
        row.field_or_relation = "colour".into();
        assert!(matches!(from_sync(&row), Err(SyncError::Protocol(_))));

        let mut row = to_sync(&committed(ChangeTarget::Tombstone, Value::record::<&str>([])));
        row.new_value = vec![0xff, 0x00];
        assert!(matches!(from_sync(&row), Err(SyncError::Protocol(_))));
    }
}

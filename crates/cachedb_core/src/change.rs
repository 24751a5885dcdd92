//! Change records: the unit of commit, replay, and sync.

use crate::model::{EntityKind, Field, RelationRole};
use crate::types::{EntityId, Stamp};
use cachedb_codec::{CodecError, CodecResult, Decode, Encode, Value};
use std::fmt;
use std::str::FromStr;

const TOMBSTONE: &str = "$tombstone";

/// What a change writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeTarget {
    /// A field slot. The value is the new field value.
    Field(Field),
    /// A to-one relation. The value is the target id or `null`.
    Link(RelationRole),
    /// Membership of `peer` in a to-many relation. The value is a bool.
    Member(RelationRole, EntityId),
    /// Deletion. The value maps slot names to the stamps the deleter saw.
    Tombstone,
}

impl fmt::Display for ChangeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(field) => f.write_str(field.name()),
            Self::Link(role) => f.write_str(role.name()),
            Self::Member(role, peer) => write!(f, "{}:{peer}", role.name()),
            Self::Tombstone => f.write_str(TOMBSTONE),
        }
    }
}

impl FromStr for ChangeTarget {
    type Err = CodecError;

    fn from_str(s: &str) -> CodecResult<Self> {
        if s == TOMBSTONE {
            return Ok(Self::Tombstone);
        }
        if let Some(field) = Field::from_name(s) {
            return Ok(Self::Field(field));
        }
        let (role, peer) = match s.split_once(':') {
            Some((role, peer)) => (role, Some(peer)),
            None => (s, None),
        };
        let role = RelationRole::from_name(role)
            .ok_or_else(|| CodecError::shape(format!("unknown change target {s:?}")))?;
        match (role.is_to_many(), peer) {
            (false, None) => Ok(Self::Link(role)),
            (true, Some(peer)) => peer
                .parse()
                .map(|peer| Self::Member(role, peer))
                .map_err(|_| CodecError::shape(format!("bad peer id in {s:?}"))),
            _ => Err(CodecError::shape(format!("malformed change target {s:?}"))),
        }
    }
}

/// One field or relationship delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Entity written.
    pub entity_id: EntityId,
    /// Kind of that entity.
    pub kind: EntityKind,
    /// Slot written.
    pub target: ChangeTarget,
    /// Value before the write, as seen by the writer. Local bookkeeping only.
    pub old: Option<Value>,
    /// Value written.
    pub new: Value,
    /// Write stamp.
    pub stamp: Stamp,
}

impl Encode for Change {
    fn to_value(&self) -> Value {
        Value::record([
            ("id", self.entity_id.to_value()),
            ("kind", Value::from(self.kind.name())),
            ("target", Value::Text(self.target.to_string())),
            ("old", self.old.clone().unwrap_or(Value::Null)),
            ("new", self.new.clone()),
            ("stamp", self.stamp.to_value()),
        ])
    }
}

impl Decode for Change {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let field = |name: &str| {
            value
                .get(name)
                .ok_or_else(|| CodecError::shape(format!("change missing {name}")))
        };
        let kind = field("kind")?
            .as_text()
            .and_then(EntityKind::from_name)
            .ok_or_else(|| CodecError::shape("unknown entity kind"))?;
        let target = field("target")?
            .as_text()
            .ok_or_else(|| CodecError::shape("change target must be text"))?
            .parse()?;
        let old = value.get("old").filter(|v| !v.is_null()).cloned();
        Ok(Self {
            entity_id: EntityId::from_value(field("id")?)?,
            kind,
            target,
            old,
            new: field("new")?.clone(),
            stamp: Stamp::from_value(field("stamp")?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceId;

    #[test]
    fn targets_round_trip_through_text() {
        let peer = EntityId::new();
        for target in [
            ChangeTarget::Field(Field::AccentColor),
            ChangeTarget::Link(RelationRole::ItemBox),
            ChangeTarget::Member(RelationRole::ItemTag, peer),
            ChangeTarget::Tombstone,
        ] {
            assert_eq!(target.to_string().parse::<ChangeTarget>().unwrap(), target);
        }
    }

    #[test]
    fn malformed_targets_are_rejected() {
        assert!("item.tags".parse::<ChangeTarget>().is_err());
        assert!("item.box:abc".parse::<ChangeTarget>().is_err());
        assert!("item.tags:not-a-uuid".parse::<ChangeTarget>().is_err());
        assert!("colour".parse::<ChangeTarget>().is_err());
    }

    #[test]
    fn change_round_trip() {
        let change = Change {
            entity_id: EntityId::new(),
            kind: EntityKind::Item,
            target: ChangeTarget::Field(Field::Name),
            old: Some(Value::from("Scarf")),
            new: Value::from("Wool scarf"),
            stamp: Stamp {
                wall_ms: 42,
                counter: 1,
                device: DeviceId::new(),
            },
        };
        assert_eq!(Change::decode(&change.encode()).unwrap(), change);
    }
}

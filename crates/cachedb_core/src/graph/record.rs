//! Per-entity state: stamped field slots and an optional tombstone.

use crate::change::ChangeTarget;
use crate::model::{EntityKind, Field};
use crate::types::Stamp;
use cachedb_codec::{CodecError, CodecResult, Value};
use std::collections::BTreeMap;

/// A value with the stamp of the write that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot<T> {
    /// Current value.
    pub value: T,
    /// Stamp of the winning write.
    pub stamp: Stamp,
}

impl<T> Slot<T> {
    /// Wraps `value` written at `stamp`.
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }
}

/// A deletion marker.
///
/// `observed` holds the stamp of every slot the deleting device had seen:
/// the entity's fields and the relation slots it owns. Writes it had
/// not seen outrank the deletion, which is how a concurrent edit keeps the
/// entity alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    /// Stamp of the (latest) deletion.
    pub stamp: Stamp,
    /// Slot stamps covered by the deletion.
    pub observed: BTreeMap<ChangeTarget, Stamp>,
}

impl Tombstone {
    /// Folds another tombstone into this one. Returns true if anything changed.
    pub fn absorb(&mut self, other: &Tombstone) -> bool {
        let mut changed = false;
        if other.stamp > self.stamp {
            self.stamp = other.stamp;
            changed = true;
        }
        for (slot, stamp) in &other.observed {
            let entry = self.observed.entry(*slot).or_insert(Stamp::MIN);
            if *stamp > *entry {
                *entry = *stamp;
                changed = true;
            }
        }
        changed
    }

    /// True if a write to `slot` at `stamp` was seen by the deleter.
    pub fn covers(&self, slot: ChangeTarget, stamp: Stamp) -> bool {
        stamp <= self.observed.get(&slot).copied().unwrap_or(Stamp::MIN)
    }

    /// The `observed` map as a CBOR value, keyed by slot name.
    pub fn observed_value(observed: &BTreeMap<ChangeTarget, Stamp>) -> Value {
        Value::record(observed.iter().map(|(slot, s)| (slot.to_string(), s.to_value())))
    }

    /// Parses an `observed` map.
    ///
    /// # Errors
    ///
    /// Fails on unknown slot names, a nested tombstone key, or malformed
    /// stamps.
    pub fn parse_observed(value: &Value) -> CodecResult<BTreeMap<ChangeTarget, Stamp>> {
        let pairs = value
            .as_map()
            .ok_or_else(|| CodecError::shape("tombstone must be a map"))?;
        pairs
            .iter()
            .map(|(k, v)| {
                let slot: ChangeTarget = k
                    .as_text()
                    .ok_or_else(|| CodecError::shape("tombstone keys must be text"))?
                    .parse()?;
                if slot == ChangeTarget::Tombstone {
                    return Err(CodecError::shape("tombstone cannot observe a tombstone"));
                }
                Ok((slot, Stamp::from_value(v)?))
            })
            .collect()
    }
}

/// The mergeable state of one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    kind: EntityKind,
    fields: BTreeMap<Field, Slot<Value>>,
    tombstone: Option<Tombstone>,
}

impl Record {
    /// An empty record of `kind`.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
            tombstone: None,
        }
    }

    /// Entity kind.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Current value of `field`, if it was ever written.
    pub fn field(&self, field: Field) -> Option<&Value> {
        self.fields.get(&field).map(|s| &s.value)
    }

    /// Slot of `field`.
    pub fn slot(&self, field: Field) -> Option<&Slot<Value>> {
        self.fields.get(&field)
    }

    /// Stamps of every written field, keyed as change targets.
    pub fn field_stamps(&self) -> impl Iterator<Item = (ChangeTarget, Stamp)> + '_ {
        self.fields
            .iter()
            .map(|(f, s)| (ChangeTarget::Field(*f), s.stamp))
    }

    /// The tombstone, if the entity was ever deleted.
    pub fn tombstone(&self) -> Option<&Tombstone> {
        self.tombstone.as_ref()
    }

    /// True if the fields alone keep the record live: it was written and
    /// never deleted, or a field write outlives the tombstone.
    ///
    /// A record with a tombstone but no fields at all (a deletion that
    /// arrived before the creation) is not live. Relation slots can also
    /// keep an entity live; [`Graph::is_live`](super::Graph::is_live)
    /// combines both.
    pub fn fields_outlive_delete(&self) -> bool {
        match &self.tombstone {
            None => !self.fields.is_empty(),
            Some(t) => self
                .fields
                .iter()
                .any(|(f, slot)| !t.covers(ChangeTarget::Field(*f), slot.stamp)),
        }
    }

    /// Last-writer-wins write. Returns the displaced slot when the write won.
    pub(crate) fn write_field(
        &mut self,
        field: Field,
        value: Value,
        stamp: Stamp,
    ) -> FieldWrite {
        match self.fields.get_mut(&field) {
            Some(slot) if stamp == slot.stamp => FieldWrite::Duplicate,
            Some(slot) if stamp < slot.stamp => FieldWrite::Stale { winner: slot.stamp },
            Some(slot) => {
                let displaced = std::mem::replace(slot, Slot::new(value, stamp));
                FieldWrite::Won {
                    displaced: Some(displaced.stamp),
                }
            }
            None => {
                self.fields.insert(field, Slot::new(value, stamp));
                FieldWrite::Won { displaced: None }
            }
        }
    }

    /// Merges a tombstone. Returns true if the record changed.
    pub(crate) fn write_tombstone(&mut self, incoming: Tombstone) -> bool {
        match &mut self.tombstone {
            Some(existing) => existing.absorb(&incoming),
            None => {
                self.tombstone = Some(incoming);
                true
            }
        }
    }
}

/// Outcome of [`Record::write_field`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldWrite {
    /// The write replaced the slot (or created it).
    Won {
        /// Stamp of the value that lost, if any.
        displaced: Option<Stamp>,
    },
    /// The same write was already applied.
    Duplicate,
    /// A later write already holds the slot.
    Stale {
        /// Stamp of the write that holds the slot.
        winner: Stamp,
    },
}

//! Forward and inverse adjacency for every relation role.
//!
//! Owners write the forward side; the inverse side is rebuilt from it inside
//! the same call, so a reader holding a graph can never observe the two
//! disagreeing.

use super::record::Slot;
use crate::change::ChangeTarget;
use crate::model::RelationRole;
use crate::types::{EntityId, Stamp};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of a stamped relation write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkWrite {
    /// The write took effect.
    Won,
    /// Already applied.
    Duplicate,
    /// A later write holds the slot.
    Stale {
        /// Stamp of the holder.
        winner: Stamp,
    },
}

fn compare(existing: Option<Stamp>, incoming: Stamp) -> LinkWrite {
    match existing {
        Some(s) if s == incoming => LinkWrite::Duplicate,
        Some(s) if s > incoming => LinkWrite::Stale { winner: s },
        _ => LinkWrite::Won,
    }
}

/// A to-one relation: each owner points at zero or one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToOne {
    forward: BTreeMap<EntityId, Slot<Option<EntityId>>>,
    inverse: BTreeMap<EntityId, BTreeSet<EntityId>>,
}

impl ToOne {
    /// Current target of `owner`.
    pub fn get(&self, owner: &EntityId) -> Option<EntityId> {
        self.forward.get(owner).and_then(|s| s.value)
    }

    /// Stamp of the last write to `owner`'s link.
    pub fn stamp(&self, owner: &EntityId) -> Option<Stamp> {
        self.forward.get(owner).map(|s| s.stamp)
    }

    /// Owners currently pointing at `target`.
    pub fn owners_of(&self, target: &EntityId) -> impl Iterator<Item = EntityId> + '_ {
        self.inverse.get(target).into_iter().flatten().copied()
    }

    pub(crate) fn write(
        &mut self,
        owner: EntityId,
        target: Option<EntityId>,
        stamp: Stamp,
    ) -> LinkWrite {
        let outcome = compare(self.stamp(&owner), stamp);
        if outcome != LinkWrite::Won {
            return outcome;
        }
        if let Some(previous) = self.get(&owner) {
            if let Some(set) = self.inverse.get_mut(&previous) {
                set.remove(&owner);
                if set.is_empty() {
                    self.inverse.remove(&previous);
                }
            }
        }
        if let Some(t) = target {
            self.inverse.entry(t).or_default().insert(owner);
        }
        self.forward.insert(owner, Slot::new(target, stamp));
        LinkWrite::Won
    }

    fn is_consistent(&self) -> bool {
        let derived_pairs = self.inverse.values().map(BTreeSet::len).sum::<usize>();
        let forward_pairs = self.forward.values().filter(|s| s.value.is_some()).count();
        derived_pairs == forward_pairs
            && self
                .inverse
                .iter()
                .all(|(t, owners)| owners.iter().all(|o| self.get(o) == Some(*t)))
    }
}

/// A many-to-many relation with a stamped membership flag per pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToMany {
    pairs: BTreeMap<(EntityId, EntityId), Slot<bool>>,
    forward: BTreeMap<EntityId, BTreeSet<EntityId>>,
    inverse: BTreeMap<EntityId, BTreeSet<EntityId>>,
}

impl ToMany {
    /// True if `owner` currently relates to `target`.
    pub fn contains(&self, owner: &EntityId, target: &EntityId) -> bool {
        self.pairs
            .get(&(*owner, *target))
            .is_some_and(|s| s.value)
    }

    /// Targets of `owner`.
    pub fn targets_of(&self, owner: &EntityId) -> impl Iterator<Item = EntityId> + '_ {
        self.forward.get(owner).into_iter().flatten().copied()
    }

    /// Owners relating to `target`.
    pub fn owners_of(&self, target: &EntityId) -> impl Iterator<Item = EntityId> + '_ {
        self.inverse.get(target).into_iter().flatten().copied()
    }

    pub(crate) fn write(
        &mut self,
        owner: EntityId,
        target: EntityId,
        present: bool,
        stamp: Stamp,
    ) -> LinkWrite {
        let key = (owner, target);
        let outcome = compare(self.pairs.get(&key).map(|s| s.stamp), stamp);
        if outcome != LinkWrite::Won {
            return outcome;
        }
        self.pairs.insert(key, Slot::new(present, stamp));
        if present {
            self.forward.entry(owner).or_default().insert(target);
            self.inverse.entry(target).or_default().insert(owner);
        } else {
            remove_edge(&mut self.forward, &owner, &target);
            remove_edge(&mut self.inverse, &target, &owner);
        }
        LinkWrite::Won
    }

    fn is_consistent(&self) -> bool {
        let live: BTreeSet<(EntityId, EntityId)> = self
            .pairs
            .iter()
            .filter(|(_, s)| s.value)
            .map(|(k, _)| *k)
            .collect();
        let forward: BTreeSet<_> = self
            .forward
            .iter()
            .flat_map(|(o, ts)| ts.iter().map(move |t| (*o, *t)))
            .collect();
        let inverse: BTreeSet<_> = self
            .inverse
            .iter()
            .flat_map(|(t, os)| os.iter().map(move |o| (*o, *t)))
            .collect();
        live == forward && live == inverse
    }
}

fn remove_edge(
    map: &mut BTreeMap<EntityId, BTreeSet<EntityId>>,
    from: &EntityId,
    to: &EntityId,
) {
    if let Some(set) = map.get_mut(from) {
        set.remove(to);
        if set.is_empty() {
            map.remove(from);
        }
    }
}

/// Every relation in the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationTable {
    item_root: ToOne,
    box_root: ToOne,
    item_box: ToOne,
    item_tag: ToMany,
}

impl RelationTable {
    /// The to-one table for `role`, or `None` for the to-many role.
    pub fn to_one(&self, role: RelationRole) -> Option<&ToOne> {
        match role {
            RelationRole::ItemRoot => Some(&self.item_root),
            RelationRole::BoxRoot => Some(&self.box_root),
            RelationRole::ItemBox => Some(&self.item_box),
            RelationRole::ItemTag => None,
        }
    }

    pub(crate) fn to_one_mut(&mut self, role: RelationRole) -> Option<&mut ToOne> {
        match role {
            RelationRole::ItemRoot => Some(&mut self.item_root),
            RelationRole::BoxRoot => Some(&mut self.box_root),
            RelationRole::ItemBox => Some(&mut self.item_box),
            RelationRole::ItemTag => None,
        }
    }

    /// Item–tag memberships.
    pub fn tags(&self) -> &ToMany {
        &self.item_tag
    }

    pub(crate) fn tags_mut(&mut self) -> &mut ToMany {
        &mut self.item_tag
    }

    /// Every relation slot `owner` has written: its target, its stamp, and
    /// whether it currently holds a link.
    pub fn owned_slots(&self, owner: &EntityId) -> Vec<(ChangeTarget, Stamp, bool)> {
        let mut slots = Vec::new();
        for (role, table) in [
            (RelationRole::ItemRoot, &self.item_root),
            (RelationRole::BoxRoot, &self.box_root),
            (RelationRole::ItemBox, &self.item_box),
        ] {
            if let Some(slot) = table.forward.get(owner) {
                slots.push((ChangeTarget::Link(role), slot.stamp, slot.value.is_some()));
            }
        }
        let first = (*owner, EntityId::from_bytes([0; 16]));
        slots.extend(
            self.item_tag
                .pairs
                .range(first..)
                .take_while(|((o, _), _)| o == owner)
                .map(|((_, tag), slot)| {
                    (
                        ChangeTarget::Member(RelationRole::ItemTag, *tag),
                        slot.stamp,
                        slot.value,
                    )
                }),
        );
        slots
    }

    /// True when every inverse index matches its forward side.
    pub fn is_consistent(&self) -> bool {
        self.item_root.is_consistent()
            && self.box_root.is_consistent()
            && self.item_box.is_consistent()
            && self.item_tag.is_consistent()
    }
}

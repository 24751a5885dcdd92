//! The in-memory object graph and its merge rules.
//!
//! Every write, local or remote, goes through [`Graph::apply`]. Field and
//! relation slots are last-writer-wins on [`Stamp`]; deletions are
//! tombstones that only cover the writes they observed. Together these make
//! applying a set of changes commutative and idempotent, so replaying the
//! journal and merging remote batches in any order converge.

mod record;
mod relations;

pub use record::{Record, Slot, Tombstone};
pub use relations::{RelationTable, ToMany, ToOne};

use crate::change::{Change, ChangeTarget};
use crate::model::{EntityKind, Field, RelationRole};
use crate::types::{EntityId, Stamp};
use cachedb_codec::Value;
use record::FieldWrite;
use relations::LinkWrite;
use serde::Serialize;
use std::collections::BTreeMap;

/// Why two writes competed for the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two devices wrote the same slot; the later stamp won.
    ConcurrentWrite,
    /// A deletion arrived for an entity with edits it had not seen.
    EditOutlivedDelete,
}

/// A resolved conflict, reported for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    /// Entity involved.
    pub entity_id: EntityId,
    /// Slot involved.
    pub target: ChangeTarget,
    /// Stamp of the surviving write.
    pub kept: Stamp,
    /// Stamp of the write that lost.
    pub discarded: Stamp,
    /// Classification.
    pub kind: ConflictKind,
}

/// Summary of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Changes that took effect.
    pub applied: usize,
    /// Changes already present.
    pub duplicates: usize,
    /// Changes superseded by a later write.
    pub stale: usize,
    /// Changes that did not fit the model and were dropped.
    pub rejected: usize,
    /// Conflicts resolved along the way.
    pub conflicts: Vec<MergeConflict>,
    /// Entities a merged edit brought back from a deletion.
    pub resurrected: Vec<EntityId>,
}

impl MergeReport {
    /// Changes that did not take effect.
    pub fn ignored(&self) -> usize {
        self.duplicates + self.stale + self.rejected
    }
}

/// All records plus the relation table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    records: BTreeMap<EntityId, Record>,
    relations: RelationTable,
}

impl Graph {
    /// Record for `id`, live or not.
    pub fn record(&self, id: &EntityId) -> Option<&Record> {
        self.records.get(id)
    }

    /// Record for `id` if it is live and of `kind`.
    pub fn live(&self, id: &EntityId, kind: EntityKind) -> Option<&Record> {
        self.records
            .get(id)
            .filter(|r| r.kind() == kind && self.record_is_live(id, r))
    }

    /// Every record, in id order.
    pub fn records(&self) -> impl Iterator<Item = (&EntityId, &Record)> {
        self.records.iter()
    }

    /// Live records of `kind`, in id order.
    pub fn live_of(&self, kind: EntityKind) -> impl Iterator<Item = (&EntityId, &Record)> {
        self.records
            .iter()
            .filter(move |(id, r)| r.kind() == kind && self.record_is_live(id, r))
    }

    /// True if `id` is a live entity of any kind.
    ///
    /// An entity is live when it was never deleted, or when a write the
    /// deleter had not seen outlives the tombstone. Such a write is a field
    /// write, or a relation slot the entity owns that still holds a link.
    /// A storage root is also live while one of its items or boxes is, so a
    /// surviving child never points at a deleted root.
    pub fn is_live(&self, id: &EntityId) -> bool {
        self.records
            .get(id)
            .is_some_and(|r| self.record_is_live(id, r))
    }

    /// The relation table.
    pub fn relations(&self) -> &RelationTable {
        &self.relations
    }

    /// Raw to-one link for `role`, regardless of target liveness.
    pub fn link(&self, owner: &EntityId, role: RelationRole) -> Option<EntityId> {
        self.relations.to_one(role).and_then(|r| r.get(owner))
    }

    /// Stamps of every slot `id` owns: its fields and its relation slots.
    /// A deletion records these as observed.
    pub fn owned_stamps(&self, id: &EntityId) -> BTreeMap<ChangeTarget, Stamp> {
        let fields = self
            .records
            .get(id)
            .into_iter()
            .flat_map(Record::field_stamps);
        let links = self
            .relations
            .owned_slots(id)
            .into_iter()
            .map(|(slot, stamp, _)| (slot, stamp));
        fields.chain(links).collect()
    }

    fn record_is_live(&self, id: &EntityId, record: &Record) -> bool {
        self.outlives_delete(id, record)
            || (record.kind() == EntityKind::StorageRoot && self.live_children(id).next().is_some())
    }

    // Liveness from the entity's own slots, ignoring children
    fn outlives_delete(&self, id: &EntityId, record: &Record) -> bool {
        if record.fields_outlive_delete() {
            return true;
        }
        let Some(tombstone) = record.tombstone() else {
            return false;
        };
        record.field_stamps().next().is_some()
            && self
                .relations
                .owned_slots(id)
                .into_iter()
                .any(|(slot, stamp, holds)| holds && !tombstone.covers(slot, stamp))
    }

    fn live_children<'a>(&'a self, root: &'a EntityId) -> impl Iterator<Item = EntityId> + 'a {
        [RelationRole::ItemRoot, RelationRole::BoxRoot]
            .into_iter()
            .filter_map(move |role| self.relations.to_one(role))
            .flat_map(move |table| table.owners_of(root))
            .filter(move |child| {
                self.records
                    .get(child)
                    .is_some_and(|r| self.outlives_delete(child, r))
            })
    }

    // Latest write keeping `id` live, for conflict reports
    fn latest_write(&self, id: &EntityId) -> Stamp {
        let own = self.owned_stamps(id).into_values().max().unwrap_or(Stamp::MIN);
        self.live_children(id)
            .flat_map(|child| self.owned_stamps(&child).into_values())
            .fold(own, Stamp::max)
    }

    // Roots a dead entity may be revived through, plus the entity itself
    fn watched(&self, change: &Change, write: &Write) -> Vec<EntityId> {
        let mut ids = vec![change.entity_id];
        for role in [RelationRole::ItemRoot, RelationRole::BoxRoot] {
            ids.extend(self.link(&change.entity_id, role));
        }
        if let Write::Link(RelationRole::ItemRoot | RelationRole::BoxRoot, Some(root)) = write {
            ids.push(*root);
        }
        ids.retain(|id| {
            self.records
                .get(id)
                .is_some_and(|r| r.tombstone().is_some() && !self.record_is_live(id, r))
        });
        ids
    }

    /// Applies one change by the merge rules.
    pub(crate) fn apply(&mut self, change: &Change, report: &mut MergeReport) {
        let write = match Write::parse(change) {
            Ok(write) => write,
            Err(reason) => {
                tracing::warn!(
                    entity = %change.entity_id,
                    target = %change.target,
                    %reason,
                    "dropping change that does not fit the model"
                );
                report.rejected += 1;
                return;
            }
        };
        if let Some(stored) = self.records.get(&change.entity_id).map(Record::kind) {
            if stored != change.kind {
                tracing::warn!(
                    entity = %change.entity_id,
                    %stored,
                    incoming = %change.kind,
                    "dropping change with mismatched entity kind"
                );
                report.rejected += 1;
                return;
            }
        }

        let dead = self.watched(change, &write);
        let applied_before = report.applied;
        self.write(change, write, report);
        if report.applied == applied_before {
            return;
        }
        for id in dead {
            if self.is_live(&id) && !report.resurrected.contains(&id) {
                report.resurrected.push(id);
            }
        }
    }

    fn write(&mut self, change: &Change, write: Write, report: &mut MergeReport) {
        let conflict = |kept: Stamp, discarded: Stamp, kind: ConflictKind| MergeConflict {
            entity_id: change.entity_id,
            target: change.target,
            kept,
            discarded,
            kind,
        };
        let record = self
            .records
            .entry(change.entity_id)
            .or_insert_with(|| Record::new(change.kind));

        match write {
            Write::Field(field) => {
                match record.write_field(field, change.new.clone(), change.stamp) {
                    FieldWrite::Won { displaced } => {
                        report.applied += 1;
                        if let Some(lost) = displaced.filter(|s| s.device != change.stamp.device) {
                            report
                                .conflicts
                                .push(conflict(change.stamp, lost, ConflictKind::ConcurrentWrite));
                        }
                    }
                    FieldWrite::Duplicate => report.duplicates += 1,
                    FieldWrite::Stale { winner } => {
                        report.stale += 1;
                        if winner.device != change.stamp.device {
                            report
                                .conflicts
                                .push(conflict(winner, change.stamp, ConflictKind::ConcurrentWrite));
                        }
                    }
                }
            }
            Write::Tombstone(observed) => {
                let changed = record.write_tombstone(Tombstone {
                    stamp: change.stamp,
                    observed,
                });
                if !changed {
                    report.duplicates += 1;
                    return;
                }
                report.applied += 1;
                if self.is_live(&change.entity_id) {
                    let edit = self.latest_write(&change.entity_id);
                    report
                        .conflicts
                        .push(conflict(edit, change.stamp, ConflictKind::EditOutlivedDelete));
                }
            }
            Write::Link(role, target) => {
                if let Some(table) = self.relations.to_one_mut(role) {
                    record_link(table.write(change.entity_id, target, change.stamp), change, report);
                }
            }
            Write::Member(_, peer, present) => {
                let outcome = self
                    .relations
                    .tags_mut()
                    .write(change.entity_id, peer, present, change.stamp);
                record_link(outcome, change, report);
            }
        }
    }
}

/// A change checked against the model, ready to write.
enum Write {
    Field(Field),
    Tombstone(BTreeMap<ChangeTarget, Stamp>),
    Link(RelationRole, Option<EntityId>),
    Member(RelationRole, EntityId, bool),
}

impl Write {
    fn parse(change: &Change) -> Result<Self, String> {
        match change.target {
            ChangeTarget::Field(field) if change.kind.has_field(field) => Ok(Self::Field(field)),
            ChangeTarget::Field(field) => Err(format!("{} has no field {field}", change.kind)),
            ChangeTarget::Tombstone => Tombstone::parse_observed(&change.new)
                .map(Self::Tombstone)
                .map_err(|err| err.to_string()),
            ChangeTarget::Link(role) | ChangeTarget::Member(role, _) if role.owner() != change.kind => {
                Err(format!("{role} is not owned by {}", change.kind))
            }
            ChangeTarget::Link(role) if role.is_to_many() => Err(format!("{role} is not to-one")),
            ChangeTarget::Link(role) => match &change.new {
                Value::Null => Ok(Self::Link(role, None)),
                other => EntityId::from_value(other)
                    .map(|id| Self::Link(role, Some(id)))
                    .map_err(|err| err.to_string()),
            },
            ChangeTarget::Member(role, _) if !role.is_to_many() => {
                Err(format!("{role} is not to-many"))
            }
            ChangeTarget::Member(role, peer) => change
                .new
                .as_bool()
                .map(|present| Self::Member(role, peer, present))
                .ok_or_else(|| "membership must be a bool".to_owned()),
        }
    }
}

fn record_link(outcome: LinkWrite, change: &Change, report: &mut MergeReport) {
    match outcome {
        LinkWrite::Won => report.applied += 1,
        LinkWrite::Duplicate => report.duplicates += 1,
        LinkWrite::Stale { winner } => {
            report.stale += 1;
            if winner.device != change.stamp.device {
                report.conflicts.push(MergeConflict {
                    entity_id: change.entity_id,
                    target: change.target,
                    kept: winner,
                    discarded: change.stamp,
                    kind: ConflictKind::ConcurrentWrite,
                });
            }
        }
    }
}

//! The entity store: versioned snapshots, a single writer, and pending changes.
//!
//! Readers take a [`Snapshot`], an `Arc` of an immutable [`Graph`]. Writers
//! run inside [`EntityStore::transact`], which mutates a private copy of the
//! graph and swaps it in only if the closure succeeds, so a reader sees
//! either the state before a transaction or the state after it.
//!
//! Every local mutation goes through [`Graph::apply`], the same path remote
//! merges take. Local writes therefore obey the merge rules by construction.

use crate::change::{Change, ChangeTarget};
use crate::clock::HybridClock;
use crate::error::{CoreError, CoreResult};
use crate::graph::{Graph, MergeReport, Tombstone};
use crate::model::{EntityKind, Field, RelationRole};
use crate::types::{DeviceId, EntityId};
use cachedb_codec::Value;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// A consistent, immutable view of the graph at one version.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub(crate) graph: Arc<Graph>,
    version: u64,
}

impl Snapshot {
    /// Monotonic version, bumped on every published transaction or merge.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The underlying graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

/// In-process authoritative graph with change tracking.
#[derive(Debug)]
pub struct EntityStore {
    current: RwLock<Snapshot>,
    // Held for the whole of a transaction or merge
    pending: Mutex<Vec<Change>>,
    clock: HybridClock,
}

impl EntityStore {
    /// An empty store stamping writes with `clock`.
    pub fn new(clock: HybridClock) -> Self {
        Self {
            current: RwLock::new(Snapshot {
                graph: Arc::new(Graph::default()),
                version: 0,
            }),
            pending: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// The device stamping local writes.
    pub fn device(&self) -> DeviceId {
        self.clock.device()
    }

    /// The current snapshot. O(1).
    pub fn snapshot(&self) -> Snapshot {
        self.current.read().clone()
    }

    /// Runs `f` as one atomic transaction.
    ///
    /// `f` works on a private copy of the graph. If it returns `Ok`, the copy
    /// is published and its changes join the pending set; if it returns
    /// `Err`, the copy and its changes are dropped.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns.
    pub fn transact<T>(&self, f: impl FnOnce(&mut Txn<'_>) -> CoreResult<T>) -> CoreResult<T> {
        let mut pending = self.pending.lock();
        let base = self.snapshot();
        let mut graph = Graph::clone(&base.graph);
        let mut txn = Txn {
            graph: &mut graph,
            clock: &self.clock,
            changes: Vec::new(),
        };
        let out = f(&mut txn)?;
        let changes = txn.changes;
        if !changes.is_empty() {
            tracing::debug!(changes = changes.len(), "transaction published");
            self.publish(graph, base.version);
            pending.extend(changes);
        }
        Ok(out)
    }

    /// Inserts a new entity with `fields`.
    ///
    /// # Errors
    ///
    /// See [`Txn::insert`].
    pub fn insert(
        &self,
        kind: EntityKind,
        fields: impl IntoIterator<Item = (Field, Value)>,
    ) -> CoreResult<EntityId> {
        self.transact(|txn| txn.insert(kind, fields))
    }

    /// Writes one field.
    ///
    /// # Errors
    ///
    /// See [`Txn::update`].
    pub fn update(&self, id: EntityId, field: Field, value: Value) -> CoreResult<()> {
        self.transact(|txn| txn.update(id, field, value))
    }

    /// Deletes an entity with its cascades.
    ///
    /// # Errors
    ///
    /// See [`Txn::delete`].
    pub fn delete(&self, id: EntityId) -> CoreResult<()> {
        self.transact(|txn| txn.delete(id))
    }

    /// Links `owner` to `target` under `role`.
    ///
    /// # Errors
    ///
    /// See [`Txn::relate`].
    pub fn relate(&self, owner: EntityId, role: RelationRole, target: EntityId) -> CoreResult<()> {
        self.transact(|txn| txn.relate(owner, role, target))
    }

    /// Removes the `owner` to `target` link under `role`.
    ///
    /// # Errors
    ///
    /// See [`Txn::unrelate`].
    pub fn unrelate(
        &self,
        owner: EntityId,
        role: RelationRole,
        target: EntityId,
    ) -> CoreResult<()> {
        self.transact(|txn| txn.unrelate(owner, role, target))
    }

    /// Applies remote or replayed changes by the merge rules.
    ///
    /// Merged changes are not pending: they are already durable elsewhere.
    /// The clock observes every incoming stamp so later local writes order
    /// after them.
    pub fn merge(&self, changes: &[Change]) -> MergeReport {
        let _pending = self.pending.lock();
        let base = self.snapshot();
        let mut graph = Graph::clone(&base.graph);
        let mut report = MergeReport::default();
        for change in changes {
            self.clock.observe(&change.stamp);
            graph.apply(change, &mut report);
        }
        for conflict in &report.conflicts {
            tracing::debug!(
                entity = %conflict.entity_id,
                target = %conflict.target,
                kept = %conflict.kept,
                discarded = %conflict.discarded,
                kind = ?conflict.kind,
                "merge conflict resolved"
            );
        }
        if report.applied > 0 {
            self.publish(graph, base.version);
        }
        report
    }

    /// Removes and returns every pending change.
    pub fn take_pending(&self) -> Vec<Change> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Puts changes back at the front of the pending set, ahead of any
    /// written since they were taken.
    pub fn restore_pending(&self, mut changes: Vec<Change>) {
        let mut pending = self.pending.lock();
        changes.append(&mut pending);
        *pending = changes;
    }

    /// Number of pending changes.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn publish(&self, graph: Graph, base_version: u64) {
        debug_assert!(graph.relations().is_consistent());
        *self.current.write() = Snapshot {
            graph: Arc::new(graph),
            version: base_version + 1,
        };
    }
}

/// A write transaction. See [`EntityStore::transact`].
///
/// Operations validate first and mutate second, so an operation that
/// returns `Err` has not touched the graph. An earlier successful
/// operation in the same transaction is still discarded when the closure
/// as a whole fails.
#[derive(Debug)]
pub struct Txn<'a> {
    graph: &'a mut Graph,
    clock: &'a HybridClock,
    changes: Vec<Change>,
}

impl Txn<'_> {
    /// The graph including this transaction's writes so far.
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Changes recorded so far.
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// Inserts a new entity of `kind` and returns its id.
    ///
    /// # Errors
    ///
    /// `Validation` if `fields` is empty or names a field `kind` lacks.
    pub fn insert(
        &mut self,
        kind: EntityKind,
        fields: impl IntoIterator<Item = (Field, Value)>,
    ) -> CoreResult<EntityId> {
        let id = EntityId::new();
        self.insert_with_id(id, kind, fields)?;
        Ok(id)
    }

    /// Inserts a new entity under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// `Validation` if the id is taken, `fields` is empty, or a field does
    /// not belong to `kind`.
    pub fn insert_with_id(
        &mut self,
        id: EntityId,
        kind: EntityKind,
        fields: impl IntoIterator<Item = (Field, Value)>,
    ) -> CoreResult<()> {
        if self.graph.record(&id).is_some() {
            return Err(CoreError::validation(format!("entity {id} already exists")));
        }
        let fields: Vec<_> = fields.into_iter().collect();
        if fields.is_empty() {
            return Err(CoreError::validation("an entity needs at least one field"));
        }
        if let Some((field, _)) = fields.iter().find(|(f, _)| !kind.has_field(*f)) {
            return Err(CoreError::validation(format!("{kind} has no field {field}")));
        }
        for (field, value) in fields {
            self.record(id, kind, ChangeTarget::Field(field), None, value);
        }
        Ok(())
    }

    /// Writes `field` of a live entity. Writing the current value is a no-op.
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` is not live, `Validation` if the field does not
    /// belong to its kind.
    pub fn update(&mut self, id: EntityId, field: Field, value: Value) -> CoreResult<()> {
        let kind = self.live_kind(id)?;
        if !kind.has_field(field) {
            return Err(CoreError::validation(format!("{kind} has no field {field}")));
        }
        let old = self
            .graph
            .record(&id)
            .and_then(|r| r.field(field))
            .cloned();
        if old.as_ref() == Some(&value) {
            return Ok(());
        }
        self.record(id, kind, ChangeTarget::Field(field), old, value);
        Ok(())
    }

    /// Deletes a live entity.
    ///
    /// The tombstone records every slot stamp the entity owns, so only
    /// writes this device has not seen can outlive it. An item keeps its
    /// own links; they are hidden while it is dead and return with it.
    ///
    /// Cascades, each recorded as its own change:
    /// - a box is cleared from every item pointing at it, which stays in its root
    /// - a tag is removed from every item carrying it
    /// - a storage root deletes its live boxes and items
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` is not live.
    pub fn delete(&mut self, id: EntityId) -> CoreResult<()> {
        let kind = self.live_kind(id)?;
        match kind {
            EntityKind::StorageBox => {
                for item in self.owners(RelationRole::ItemBox, id) {
                    self.set_link(item, RelationRole::ItemBox, None);
                }
            }
            EntityKind::Tag => {
                let items: Vec<_> = self.graph.relations().tags().owners_of(&id).collect();
                for item in items {
                    self.set_member(item, id, false);
                }
            }
            EntityKind::Item => {}
            EntityKind::StorageRoot => {
                for item in self.owners(RelationRole::ItemRoot, id) {
                    if self.graph.live(&item, EntityKind::Item).is_some() {
                        self.delete(item)?;
                    }
                }
                for storage_box in self.owners(RelationRole::BoxRoot, id) {
                    if self.graph.live(&storage_box, EntityKind::StorageBox).is_some() {
                        self.delete(storage_box)?;
                    }
                }
            }
        }
        let observed = self.graph.owned_stamps(&id);
        self.record(
            id,
            kind,
            ChangeTarget::Tombstone,
            None,
            Tombstone::observed_value(&observed),
        );
        Ok(())
    }

    /// Links `owner` to `target` under `role`.
    ///
    /// For a to-one role this replaces any previous target. Linking an item
    /// to a box requires both to share a storage root. Relating what is
    /// already related is a no-op.
    ///
    /// # Errors
    ///
    /// `NotFound` if either entity is not live with the kinds `role`
    /// connects, `Validation` for a cross-root box assignment.
    pub fn relate(&mut self, owner: EntityId, role: RelationRole, target: EntityId) -> CoreResult<()> {
        self.expect_live(owner, role.owner())?;
        self.expect_live(target, role.target())?;
        if role.is_to_many() {
            if !self.graph.relations().tags().contains(&owner, &target) {
                self.set_member(owner, target, true);
            }
            return Ok(());
        }
        if role == RelationRole::ItemBox {
            let item_root = self.graph.link(&owner, RelationRole::ItemRoot);
            let box_root = self.graph.link(&target, RelationRole::BoxRoot);
            if item_root.is_none() || item_root != box_root {
                return Err(CoreError::validation(
                    "an item's box must belong to the item's storage root",
                ));
            }
        }
        if role == RelationRole::ItemRoot {
            if let Some(current) = self.graph.link(&owner, RelationRole::ItemRoot) {
                if current != target && self.graph.link(&owner, RelationRole::ItemBox).is_some() {
                    return Err(CoreError::validation(
                        "move the item out of its box before changing its storage root",
                    ));
                }
            }
        }
        if self.graph.link(&owner, role) != Some(target) {
            self.set_link(owner, role, Some(target));
        }
        Ok(())
    }

    /// Removes the `owner` to `target` link. A missing link is a no-op.
    ///
    /// # Errors
    ///
    /// `NotFound` if `owner` is not live, `Validation` when removing an
    /// item's storage root, which every item must keep.
    pub fn unrelate(
        &mut self,
        owner: EntityId,
        role: RelationRole,
        target: EntityId,
    ) -> CoreResult<()> {
        self.expect_live(owner, role.owner())?;
        match role {
            RelationRole::ItemTag => {
                if self.graph.relations().tags().contains(&owner, &target) {
                    self.set_member(owner, target, false);
                }
            }
            RelationRole::ItemRoot | RelationRole::BoxRoot => {
                return Err(CoreError::validation(format!(
                    "{} cannot be removed, only replaced",
                    role
                )));
            }
            RelationRole::ItemBox => {
                if self.graph.link(&owner, role) == Some(target) {
                    self.set_link(owner, role, None);
                }
            }
        }
        Ok(())
    }

    fn live_kind(&self, id: EntityId) -> CoreResult<EntityKind> {
        match self.graph.record(&id) {
            Some(record) if self.graph.is_live(&id) => Ok(record.kind()),
            Some(record) => Err(CoreError::NotFound {
                kind: record.kind(),
                id,
            }),
            // Kind is unknown; Item is the most common lookup
            None => Err(CoreError::NotFound {
                kind: EntityKind::Item,
                id,
            }),
        }
    }

    pub(crate) fn expect_live(&self, id: EntityId, kind: EntityKind) -> CoreResult<()> {
        match self.graph.live(&id, kind) {
            Some(_) => Ok(()),
            None => Err(CoreError::NotFound { kind, id }),
        }
    }

    fn owners(&self, role: RelationRole, target: EntityId) -> Vec<EntityId> {
        self.graph
            .relations()
            .to_one(role)
            .map(|r| r.owners_of(&target).collect())
            .unwrap_or_default()
    }

    fn set_link(&mut self, owner: EntityId, role: RelationRole, target: Option<EntityId>) {
        let old = self.graph.link(&owner, role).map(|id| id.to_value());
        let new = target.map_or(Value::Null, |id| id.to_value());
        self.record(owner, role.owner(), ChangeTarget::Link(role), old, new);
    }

    fn set_member(&mut self, item: EntityId, tag: EntityId, present: bool) {
        let role = RelationRole::ItemTag;
        self.record(
            item,
            role.owner(),
            ChangeTarget::Member(role, tag),
            Some(Value::Bool(!present)),
            Value::Bool(present),
        );
    }

    fn record(
        &mut self,
        entity_id: EntityId,
        kind: EntityKind,
        target: ChangeTarget,
        old: Option<Value>,
        new: Value,
    ) {
        let change = Change {
            entity_id,
            kind,
            target,
            old,
            new,
            stamp: self.clock.tick(),
        };
        let mut report = MergeReport::default();
        self.graph.apply(&change, &mut report);
        debug_assert_eq!(report.applied, 1, "local write must win: {change:?}");
        self.changes.push(change);
    }

    #[cfg(test)]
    fn last_stamp(&self) -> Option<crate::types::Stamp> {
        self.changes.last().map(|c| c.stamp)
    }
}

//! Typed read views over a [`Snapshot`].
//!
//! Views decode attribute blobs lazily. A corrupt blob is logged and the
//! field reads as absent; the rest of the entity still loads.

use crate::attribute::{AttributeTransformer, Color, ColorTransformer, Image, ImageTransformer};
use crate::error::{CoreError, CoreResult};
use crate::graph::Record;
use crate::model::{EntityKind, Field, RelationRole};
use crate::store::Snapshot;
use crate::types::EntityId;
use cachedb_codec::{Decimal, Value};
use chrono::{DateTime, TimeZone, Utc};

/// A top-level location ("Cache").
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRoot {
    /// Entity id.
    pub id: EntityId,
    /// Display name.
    pub name: String,
    /// Icon reference.
    pub icon: Option<String>,
    /// Accent color.
    pub accent_color: Option<Color>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

/// A box inside a storage root.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageBox {
    /// Entity id.
    pub id: EntityId,
    /// Owning storage root.
    pub root: EntityId,
    /// Display name.
    pub name: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

/// A tracked item.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    /// Entity id.
    pub id: EntityId,
    /// Owning storage root.
    pub root: EntityId,
    /// Containing box, if it is live and in the same root.
    pub storage_box: Option<EntityId>,
    /// Display name.
    pub name: String,
    /// Free text.
    pub description: Option<String>,
    /// Photo.
    pub image: Option<Image>,
    /// Physical dimensions; empty when unset.
    pub dimensions: Vec<Decimal>,
    /// Weight.
    pub weight: Option<Decimal>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Ids of live tags, in id order.
    pub tags: Vec<EntityId>,
}

/// A label.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Entity id.
    pub id: EntityId,
    /// Display name.
    pub name: String,
    /// Label color.
    pub color: Option<Color>,
}

fn text(record: &Record, field: Field) -> Option<String> {
    record.field(field).and_then(Value::as_text).map(str::to_owned)
}

fn instant(record: &Record) -> DateTime<Utc> {
    record
        .field(Field::CreatedAt)
        .and_then(Value::as_integer)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Snapshot {
    /// Decodes the blob in `field` of entity `id`.
    ///
    /// Returns `Ok(None)` when the entity has no value for the field.
    ///
    /// # Errors
    ///
    /// `CorruptAttribute` if the stored bytes do not decode as `T`.
    pub fn attribute<T: AttributeTransformer>(
        &self,
        id: &EntityId,
        field: Field,
    ) -> CoreResult<Option<T::Value>> {
        let Some(value) = self.graph.record(id).and_then(|r| r.field(field)) else {
            return Ok(None);
        };
        if value.is_null() {
            return Ok(None);
        }
        let corrupt = |reason: String| CoreError::CorruptAttribute { field, reason };
        let bytes = value
            .as_bytes()
            .ok_or_else(|| corrupt("expected a byte string".into()))?;
        T::decode(bytes).map(Some).map_err(|e| corrupt(e.to_string()))
    }

    fn lenient<T: AttributeTransformer>(&self, id: &EntityId, field: Field) -> Option<T::Value> {
        match self.attribute::<T>(id, field) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(entity = %id, %err, "loading entity without corrupt attribute");
                None
            }
        }
    }

    /// True if `id` is a live entity of any kind.
    pub fn is_live(&self, id: &EntityId) -> bool {
        self.graph.is_live(id)
    }

    /// Live storage roots, oldest first.
    pub fn storage_roots(&self) -> Vec<StorageRoot> {
        let mut roots: Vec<_> = self
            .graph
            .live_of(EntityKind::StorageRoot)
            .filter_map(|(id, _)| self.storage_root(id))
            .collect();
        roots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        roots
    }

    /// A live storage root.
    pub fn storage_root(&self, id: &EntityId) -> Option<StorageRoot> {
        let record = self.graph.live(id, EntityKind::StorageRoot)?;
        Some(StorageRoot {
            id: *id,
            name: text(record, Field::Name).unwrap_or_default(),
            icon: text(record, Field::Icon),
            accent_color: self.lenient::<ColorTransformer>(id, Field::AccentColor),
            created_at: instant(record),
        })
    }

    /// A live box whose storage root is live.
    pub fn storage_box(&self, id: &EntityId) -> Option<StorageBox> {
        let record = self.graph.live(id, EntityKind::StorageBox)?;
        let root = self.graph.link(id, RelationRole::BoxRoot)?;
        self.graph.live(&root, EntityKind::StorageRoot)?;
        Some(StorageBox {
            id: *id,
            root,
            name: text(record, Field::Name).unwrap_or_default(),
            created_at: instant(record),
        })
    }

    /// Visible boxes of `root`, oldest first.
    pub fn boxes_in(&self, root: &EntityId) -> Vec<StorageBox> {
        let mut boxes: Vec<_> = self
            .owners(RelationRole::BoxRoot, root)
            .iter()
            .filter_map(|id| self.storage_box(id))
            .collect();
        boxes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        boxes
    }

    /// A live item whose storage root is live.
    pub fn item(&self, id: &EntityId) -> Option<Item> {
        let record = self.graph.live(id, EntityKind::Item)?;
        let root = self.graph.link(id, RelationRole::ItemRoot)?;
        self.graph.live(&root, EntityKind::StorageRoot)?;
        // A concurrent merge may leave the link pointing at a dead or
        // foreign box; such a box is not shown
        let storage_box = self
            .graph
            .link(id, RelationRole::ItemBox)
            .filter(|b| self.storage_box(b).is_some_and(|b| b.root == root));
        let dimensions = record
            .field(Field::Dimensions)
            .and_then(Value::as_array)
            .map(|parts| parts.iter().filter_map(Value::as_decimal).collect())
            .unwrap_or_default();
        let tags = self
            .graph
            .relations()
            .tags()
            .targets_of(id)
            .filter(|t| self.graph.live(t, EntityKind::Tag).is_some())
            .collect();
        Some(Item {
            id: *id,
            root,
            storage_box,
            name: text(record, Field::Name).unwrap_or_default(),
            description: text(record, Field::Description),
            image: self.lenient::<ImageTransformer>(id, Field::Image),
            dimensions,
            weight: record.field(Field::Weight).and_then(Value::as_decimal),
            created_at: instant(record),
            tags,
        })
    }

    /// Visible items of `root`, oldest first.
    pub fn items_in(&self, root: &EntityId) -> Vec<Item> {
        self.items(self.owners(RelationRole::ItemRoot, root))
    }

    /// Visible items shown in `storage_box`, oldest first.
    pub fn items_in_box(&self, storage_box: &EntityId) -> Vec<Item> {
        let mut items = self.items(self.owners(RelationRole::ItemBox, storage_box));
        items.retain(|i| i.storage_box.as_ref() == Some(storage_box));
        items
    }

    /// A live tag.
    pub fn tag(&self, id: &EntityId) -> Option<Tag> {
        let record = self.graph.live(id, EntityKind::Tag)?;
        Some(Tag {
            id: *id,
            name: text(record, Field::Name).unwrap_or_default(),
            color: self.lenient::<ColorTransformer>(id, Field::Color),
        })
    }

    /// Live tags, by name.
    pub fn tags(&self) -> Vec<Tag> {
        let mut tags: Vec<_> = self
            .graph
            .live_of(EntityKind::Tag)
            .filter_map(|(id, _)| self.tag(id))
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        tags
    }

    /// Live tags attached to `item`, by name.
    pub fn tags_of(&self, item: &EntityId) -> Vec<Tag> {
        let mut tags: Vec<_> = self
            .graph
            .relations()
            .tags()
            .targets_of(item)
            .filter_map(|t| self.tag(&t))
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        tags
    }

    /// Visible items carrying `tag`, oldest first.
    pub fn items_tagged(&self, tag: &EntityId) -> Vec<Item> {
        let owners = self.graph.relations().tags().owners_of(tag).collect();
        self.items(owners)
    }

    /// Number of live entities of `kind`.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.graph.live_of(kind).count()
    }

    /// Number of records holding a tombstone, live or not.
    pub fn tombstones(&self) -> usize {
        self.graph
            .records()
            .filter(|(_, r)| r.tombstone().is_some())
            .count()
    }

    fn owners(&self, role: RelationRole, target: &EntityId) -> Vec<EntityId> {
        self.graph
            .relations()
            .to_one(role)
            .map(|r| r.owners_of(target).collect())
            .unwrap_or_default()
    }

    fn items(&self, ids: Vec<EntityId>) -> Vec<Item> {
        let mut items: Vec<_> = ids.iter().filter_map(|id| self.item(id)).collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }
}

#[cfg(test)]
mod tests {
    use crate::attribute::{AttributeTransformer, Color, ColorTransformer};
    use crate::clock::{HybridClock, ManualTimeSource};
    use crate::model::{EntityKind, Field, RelationRole};
    use crate::store::EntityStore;
    use crate::types::DeviceId;
    use cachedb_codec::Value;

    fn store() -> EntityStore {
        EntityStore::new(HybridClock::new(
            DeviceId::new(),
            ManualTimeSource::starting_at(10),
        ))
    }

    #[test]
    fn corrupt_color_loads_tag_without_it() {
        let store = store();
        let mut blob = ColorTransformer::encode(&Color::rgb(1, 2, 3));
        blob[5] ^= 0xff;
        let tag = store
            .insert(
                EntityKind::Tag,
                [(Field::Name, Value::from("Red")), (Field::Color, Value::Bytes(blob))],
            )
            .unwrap();
        let snapshot = store.snapshot();
        let view = snapshot.tag(&tag).unwrap();
        assert_eq!(view.name, "Red");
        assert_eq!(view.color, None);
        assert!(matches!(
            snapshot.attribute::<ColorTransformer>(&tag, Field::Color),
            Err(crate::CoreError::CorruptAttribute { field: Field::Color, .. })
        ));
    }

    #[test]
    fn item_in_dead_root_is_hidden() {
        let store = store();
        let (root, item) = store
            .transact(|txn| {
                let root = txn.insert(EntityKind::StorageRoot, [(Field::Name, Value::from("R"))])?;
                let item = txn.insert(EntityKind::Item, [(Field::Name, Value::from("I"))])?;
                txn.relate(item, RelationRole::ItemRoot, root)?;
                Ok((root, item))
            })
            .unwrap();
        assert_eq!(store.snapshot().items_in(&root).len(), 1);
        store.delete(root).unwrap();
        let snapshot = store.snapshot();
        assert!(snapshot.item(&item).is_none());
        assert!(snapshot.storage_roots().is_empty());
        assert_eq!(snapshot.tombstones(), 2);
    }

    #[test]
    fn tags_of_skips_dead_tags() {
        let store = store();
        let (item, keep, drop) = store
            .transact(|txn| {
                let root = txn.insert(EntityKind::StorageRoot, [(Field::Name, Value::from("R"))])?;
                let item = txn.insert(EntityKind::Item, [(Field::Name, Value::from("I"))])?;
                txn.relate(item, RelationRole::ItemRoot, root)?;
                let keep = txn.insert(EntityKind::Tag, [(Field::Name, Value::from("Keep"))])?;
                let drop = txn.insert(EntityKind::Tag, [(Field::Name, Value::from("Drop"))])?;
                txn.relate(item, RelationRole::ItemTag, keep)?;
                txn.relate(item, RelationRole::ItemTag, drop)?;
                Ok((item, keep, drop))
            })
            .unwrap();
        store.delete(drop).unwrap();
        let snapshot = store.snapshot();
        let names: Vec<_> = snapshot.tags_of(&item).into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["Keep"]);
        assert_eq!(snapshot.item(&item).unwrap().tags, vec![keep]);
        assert!(snapshot.items_tagged(&drop).is_empty());
    }
}

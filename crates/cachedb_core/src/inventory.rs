//! Domain operations.
//!
//! [`Inventory`] is the handle an application constructs once and passes
//! down. Every mutator validates, applies its changes as one store
//! transaction, and then waits for a coalesced commit. Validation failures
//! leave the store untouched.

use crate::attribute::{AttributeTransformer, Color, ColorTransformer, Image, ImageTransformer};
use crate::clock::TimeSource;
use crate::commit_queue::CommitQueue;
use crate::config::{Config, StoreLocation};
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::model::{EntityKind, Field, RelationRole};
use crate::persistence::{CommitReceipt, Persistence, RecoveryReport};
use crate::store::{Snapshot, Txn};
use crate::types::{DeviceId, EntityId};
use cachedb_codec::{Decimal, Value};
use cachedb_storage::{FileBackend, InMemoryBackend, StorageBackend};
use std::sync::Arc;

/// Fields of a new storage root.
#[derive(Debug, Clone, Default)]
pub struct NewStorageRoot {
    /// Display name; must not be blank.
    pub name: String,
    /// Icon reference.
    pub icon: Option<String>,
    /// Accent color.
    pub accent_color: Option<Color>,
}

impl NewStorageRoot {
    /// A root called `name` with no icon or color.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the icon reference.
    #[must_use]
    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Sets the accent color.
    #[must_use]
    pub fn accent_color(mut self, color: Color) -> Self {
        self.accent_color = Some(color);
        self
    }
}

/// Fields of a new item.
#[derive(Debug, Clone, Default)]
pub struct NewItem {
    /// Display name; must not be blank.
    pub name: String,
    /// Owning storage root. Required.
    pub root: Option<EntityId>,
    /// Box in the same root.
    pub storage_box: Option<EntityId>,
    /// Free text.
    pub description: Option<String>,
    /// Photo.
    pub image: Option<Image>,
    /// One to three non-negative measurements, or empty.
    pub dimensions: Vec<Decimal>,
    /// Positive weight.
    pub weight: Option<Decimal>,
}

impl NewItem {
    /// An item called `name` with nothing else set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Places the item in `root`.
    #[must_use]
    pub fn in_root(mut self, root: EntityId) -> Self {
        self.root = Some(root);
        self
    }

    /// Places the item in `storage_box`.
    #[must_use]
    pub fn in_box(mut self, storage_box: EntityId) -> Self {
        self.storage_box = Some(storage_box);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Sets the photo.
    #[must_use]
    pub fn image(mut self, image: Image) -> Self {
        self.image = Some(image);
        self
    }

    /// Sets the dimensions.
    #[must_use]
    pub fn dimensions(mut self, dimensions: Vec<Decimal>) -> Self {
        self.dimensions = dimensions;
        self
    }

    /// Sets the weight.
    #[must_use]
    pub fn weight(mut self, weight: Decimal) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Field edits for an existing item. `None` leaves a field as it is; an
/// inner `None` clears it.
#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    /// New name.
    pub name: Option<String>,
    /// New or cleared description.
    pub description: Option<Option<String>>,
    /// New or cleared photo.
    pub image: Option<Option<Image>>,
    /// New dimensions; empty clears them.
    pub dimensions: Option<Vec<Decimal>>,
    /// New or cleared weight.
    pub weight: Option<Option<Decimal>>,
}

impl ItemUpdate {
    /// Renames the item.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets or clears the description.
    #[must_use]
    pub fn description(mut self, text: Option<String>) -> Self {
        self.description = Some(text);
        self
    }

    /// Sets or clears the photo.
    #[must_use]
    pub fn image(mut self, image: Option<Image>) -> Self {
        self.image = Some(image);
        self
    }

    /// Replaces the dimensions.
    #[must_use]
    pub fn dimensions(mut self, dimensions: Vec<Decimal>) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Sets or clears the weight.
    #[must_use]
    pub fn weight(mut self, weight: Option<Decimal>) -> Self {
        self.weight = Some(weight);
        self
    }
}

fn check_name(name: &str) -> CoreResult<Value> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CoreError::validation("name must not be empty"));
    }
    Ok(Value::from(trimmed))
}

fn check_weight(weight: Option<Decimal>) -> CoreResult<Value> {
    match weight {
        Some(w) if !w.is_positive() => Err(CoreError::validation(format!(
            "weight must be positive, got {w}"
        ))),
        Some(w) => Ok(Value::Decimal(w)),
        None => Ok(Value::Null),
    }
}

fn check_dimensions(dimensions: &[Decimal]) -> CoreResult<Value> {
    if dimensions.is_empty() {
        return Ok(Value::Null);
    }
    if dimensions.len() > 3 {
        return Err(CoreError::validation(format!(
            "at most 3 dimensions, got {}",
            dimensions.len()
        )));
    }
    if let Some(d) = dimensions.iter().find(|d| d.is_negative()) {
        return Err(CoreError::validation(format!("dimension must not be negative, got {d}")));
    }
    Ok(Value::Array(dimensions.iter().copied().map(Value::Decimal).collect()))
}

fn blob<T: AttributeTransformer>(value: Option<&T::Value>) -> Value {
    value.map_or(Value::Null, |v| Value::Bytes(T::encode(v)))
}

/// An open inventory store.
#[derive(Debug)]
pub struct Inventory {
    persistence: Arc<Persistence>,
    queue: CommitQueue,
    time: Arc<dyn TimeSource>,
    // Holds the directory lock for as long as the inventory is open
    _dir: Option<StoreDir>,
}

impl Inventory {
    /// Opens the store `config` describes, replaying its journal.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// `StoreLocked` if another process has the directory open,
    /// `StoreUnavailable` if the journal cannot be recovered.
    pub async fn open(config: Config) -> CoreResult<Self> {
        let (inventory, _) = Self::open_with_report(config).await?;
        Ok(inventory)
    }

    /// Like [`Inventory::open`], also returning what recovery found.
    ///
    /// # Errors
    ///
    /// See [`Inventory::open`].
    pub async fn open_with_report(config: Config) -> CoreResult<(Self, RecoveryReport)> {
        let opened = tokio::task::spawn_blocking(move || -> CoreResult<_> {
            let (dir, backend): (Option<StoreDir>, Box<dyn StorageBackend>) = match &config.location
            {
                StoreLocation::InMemory => (None, Box::new(InMemoryBackend::new())),
                StoreLocation::Directory(path) => {
                    let dir = StoreDir::open(path, config.create_if_missing)?;
                    let backend = FileBackend::open(&dir.journal_path())?;
                    (Some(dir), Box::new(backend))
                }
            };
            let (persistence, report) = Persistence::recover(backend, &config)?;
            Ok((dir, persistence, report, config))
        })
        .await
        .map_err(|e| CoreError::unavailable(format!("open task failed: {e}")))??;

        let (dir, persistence, report, config) = opened;
        if let Some(dir) = &dir {
            tracing::info!(path = %dir.path().display(), device = %persistence.device(), "store opened");
        } else {
            tracing::info!(device = %persistence.device(), "in-memory store opened");
        }
        Ok((Self::assemble(persistence, &config, dir), report))
    }

    /// Opens a store over a caller-supplied backend. `config.location` is
    /// ignored. Like [`Inventory::open`], this starts the commit task on the
    /// current runtime.
    ///
    /// # Errors
    ///
    /// See [`Inventory::open`].
    pub async fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        config: &Config,
    ) -> CoreResult<Self> {
        let (persistence, _) = Persistence::recover(backend, config)?;
        Ok(Self::assemble(persistence, config, None))
    }

    /// An empty in-memory store.
    ///
    /// # Errors
    ///
    /// Only fails if the runtime cannot run the open task.
    pub async fn in_memory() -> CoreResult<Self> {
        Self::open(Config::in_memory()).await
    }

    fn assemble(persistence: Persistence, config: &Config, dir: Option<StoreDir>) -> Self {
        let persistence = Arc::new(persistence);
        Self {
            queue: CommitQueue::spawn(Arc::clone(&persistence)),
            persistence,
            time: Arc::clone(&config.time_source),
            _dir: dir,
        }
    }

    /// The durability layer, for the sync engine.
    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    /// This installation's device id.
    pub fn device(&self) -> DeviceId {
        self.persistence.device()
    }

    /// The current read snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.persistence.store().snapshot()
    }

    /// Commits whatever is pending. Use it to retry after a `CommitFailure`.
    ///
    /// # Errors
    ///
    /// `CommitFailure` if the write fails again.
    pub async fn commit(&self) -> CoreResult<CommitReceipt> {
        self.queue.commit().await
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut Txn<'_>) -> CoreResult<T>) -> CoreResult<T> {
        let out = self.persistence.store().transact(f)?;
        self.queue.commit().await?;
        Ok(out)
    }

    fn now(&self) -> Value {
        Value::Integer(self.time.now_ms())
    }

    /// Creates a storage root.
    ///
    /// # Errors
    ///
    /// `Validation` for a blank name; `CommitFailure` if the commit fails,
    /// in which case the root exists but is not yet durable.
    pub async fn create_storage_root(&self, root: NewStorageRoot) -> CoreResult<EntityId> {
        let name = check_name(&root.name)?;
        let mut fields = vec![
            (Field::Name, name),
            (Field::CreatedAt, self.now()),
        ];
        if let Some(icon) = root.icon {
            fields.push((Field::Icon, Value::from(icon)));
        }
        if let Some(color) = &root.accent_color {
            fields.push((Field::AccentColor, blob::<ColorTransformer>(Some(color))));
        }
        self.mutate(|txn| txn.insert(EntityKind::StorageRoot, fields))
            .await
    }

    /// Deletes a storage root with all its boxes and items.
    ///
    /// # Errors
    ///
    /// `NotFound` if the root is not live.
    pub async fn delete_storage_root(&self, id: EntityId) -> CoreResult<()> {
        self.mutate(|txn| {
            txn.expect_live(id, EntityKind::StorageRoot)?;
            txn.delete(id)
        })
        .await
    }

    /// Creates a box in `root`.
    ///
    /// # Errors
    ///
    /// `Validation` for a blank name, `NotFound` for a dead root.
    pub async fn create_box(&self, root: EntityId, name: &str) -> CoreResult<EntityId> {
        let name = check_name(name)?;
        let created = self.now();
        self.mutate(|txn| {
            txn.expect_live(root, EntityKind::StorageRoot)?;
            let id = txn.insert(
                EntityKind::StorageBox,
                [(Field::Name, name), (Field::CreatedAt, created)],
            )?;
            txn.relate(id, RelationRole::BoxRoot, root)?;
            Ok(id)
        })
        .await
    }

    /// Deletes a box. Its items stay in the storage root, boxless.
    ///
    /// # Errors
    ///
    /// `NotFound` if the box is not live.
    pub async fn delete_box(&self, id: EntityId) -> CoreResult<()> {
        self.mutate(|txn| {
            txn.expect_live(id, EntityKind::StorageBox)?;
            txn.delete(id)
        })
        .await
    }

    /// Creates an item.
    ///
    /// # Errors
    ///
    /// `Validation` for a missing, unknown or dead root, a box in another
    /// root, a blank name, a non-positive weight, or bad dimensions.
    pub async fn create_item(&self, item: NewItem) -> CoreResult<EntityId> {
        let root = item
            .root
            .ok_or_else(|| CoreError::validation("an item needs a storage root"))?;
        let mut fields = vec![(Field::Name, check_name(&item.name)?), (Field::CreatedAt, self.now())];
        match check_weight(item.weight)? {
            Value::Null => {}
            weight => fields.push((Field::Weight, weight)),
        }
        match check_dimensions(&item.dimensions)? {
            Value::Null => {}
            dims => fields.push((Field::Dimensions, dims)),
        }
        if let Some(text) = item.description {
            fields.push((Field::Description, Value::from(text)));
        }
        if let Some(image) = &item.image {
            fields.push((Field::Image, blob::<ImageTransformer>(Some(image))));
        }

        self.mutate(|txn| {
            if txn.graph().live(&root, EntityKind::StorageRoot).is_none() {
                return Err(CoreError::validation(format!("storage root {root} does not exist")));
            }
            if let Some(b) = item.storage_box {
                if txn.graph().link(&b, RelationRole::BoxRoot) != Some(root) {
                    return Err(CoreError::validation(
                        "an item's box must belong to the item's storage root",
                    ));
                }
                txn.expect_live(b, EntityKind::StorageBox)?;
            }
            let id = txn.insert(EntityKind::Item, fields)?;
            txn.relate(id, RelationRole::ItemRoot, root)?;
            if let Some(b) = item.storage_box {
                txn.relate(id, RelationRole::ItemBox, b)?;
            }
            Ok(id)
        })
        .await
    }

    /// Edits an item's fields.
    ///
    /// # Errors
    ///
    /// `NotFound` for a dead item, `Validation` for invalid values.
    pub async fn update_item(&self, id: EntityId, update: ItemUpdate) -> CoreResult<()> {
        let mut fields = Vec::new();
        if let Some(name) = &update.name {
            fields.push((Field::Name, check_name(name)?));
        }
        if let Some(weight) = update.weight {
            fields.push((Field::Weight, check_weight(weight)?));
        }
        if let Some(dims) = &update.dimensions {
            fields.push((Field::Dimensions, check_dimensions(dims)?));
        }
        if let Some(text) = update.description {
            fields.push((Field::Description, text.map_or(Value::Null, Value::from)));
        }
        if let Some(image) = &update.image {
            fields.push((Field::Image, blob::<ImageTransformer>(image.as_ref())));
        }
        self.mutate(|txn| {
            txn.expect_live(id, EntityKind::Item)?;
            for (field, value) in fields {
                txn.update(id, field, value)?;
            }
            Ok(())
        })
        .await
    }

    /// Moves an item into a box of its own root, or out of any box.
    ///
    /// # Errors
    ///
    /// `NotFound` for a dead item or box, `Validation` for a box in
    /// another root.
    pub async fn move_item(&self, item: EntityId, storage_box: Option<EntityId>) -> CoreResult<()> {
        self.mutate(|txn| {
            txn.expect_live(item, EntityKind::Item)?;
            match storage_box {
                Some(b) => txn.relate(item, RelationRole::ItemBox, b),
                None => match txn.graph().link(&item, RelationRole::ItemBox) {
                    Some(current) => txn.unrelate(item, RelationRole::ItemBox, current),
                    None => Ok(()),
                },
            }
        })
        .await
    }

    /// Deletes an item. Its box and tags stay recorded but hidden, so an
    /// edit that outlives the delete brings them back with it.
    ///
    /// # Errors
    ///
    /// `NotFound` if the item is not live.
    pub async fn delete_item(&self, id: EntityId) -> CoreResult<()> {
        self.mutate(|txn| {
            txn.expect_live(id, EntityKind::Item)?;
            txn.delete(id)
        })
        .await
    }

    /// Creates a tag.
    ///
    /// # Errors
    ///
    /// `Validation` for a blank name.
    pub async fn create_tag(&self, name: &str, color: Option<Color>) -> CoreResult<EntityId> {
        let mut fields = vec![(Field::Name, check_name(name)?)];
        if let Some(color) = &color {
            fields.push((Field::Color, blob::<ColorTransformer>(Some(color))));
        }
        self.mutate(|txn| txn.insert(EntityKind::Tag, fields)).await
    }

    /// Deletes a tag, detaching it from every item.
    ///
    /// # Errors
    ///
    /// `NotFound` if the tag is not live.
    pub async fn delete_tag(&self, id: EntityId) -> CoreResult<()> {
        self.mutate(|txn| {
            txn.expect_live(id, EntityKind::Tag)?;
            txn.delete(id)
        })
        .await
    }

    /// Attaches `tag` to `item`.
    ///
    /// # Errors
    ///
    /// `NotFound` if either is not live.
    pub async fn attach_tag(&self, item: EntityId, tag: EntityId) -> CoreResult<()> {
        self.mutate(|txn| txn.relate(item, RelationRole::ItemTag, tag))
            .await
    }

    /// Detaches `tag` from `item`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the item is not live.
    pub async fn detach_tag(&self, item: EntityId, tag: EntityId) -> CoreResult<()> {
        self.mutate(|txn| txn.unrelate(item, RelationRole::ItemTag, tag))
            .await
    }

    /// The persisted sync flag.
    pub fn sync_enabled(&self) -> bool {
        self.persistence.sync_enabled()
    }

    /// Persists the sync flag.
    ///
    /// # Errors
    ///
    /// Fails if the setting cannot be written.
    pub async fn set_sync_enabled(&self, enabled: bool) -> CoreResult<()> {
        let p = Arc::clone(&self.persistence);
        tokio::task::spawn_blocking(move || p.set_sync_enabled(enabled))
            .await
            .map_err(|e| CoreError::unavailable(format!("settings task failed: {e}")))?
    }
}

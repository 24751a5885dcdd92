//! Entity kinds, their fields, and the relation roles between them.

use serde::Serialize;
use std::fmt;

/// The four kinds of entity in an inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EntityKind {
    /// A top-level named location ("Cache") owning boxes and items.
    StorageRoot = 1,
    /// A box inside a storage root.
    StorageBox = 2,
    /// A tracked item.
    Item = 3,
    /// A label attachable to many items.
    Tag = 4,
}

impl EntityKind {
    /// All kinds, in code order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::StorageRoot,
        EntityKind::StorageBox,
        EntityKind::Item,
        EntityKind::Tag,
    ];

    /// Wire name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::StorageRoot => "storage_root",
            Self::StorageBox => "box",
            Self::Item => "item",
            Self::Tag => "tag",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Fields this kind carries.
    #[must_use]
    pub const fn fields(self) -> &'static [Field] {
        match self {
            Self::StorageRoot => &[Field::Name, Field::Icon, Field::AccentColor, Field::CreatedAt],
            Self::StorageBox => &[Field::Name, Field::CreatedAt],
            Self::Item => &[
                Field::Name,
                Field::Description,
                Field::Image,
                Field::Dimensions,
                Field::Weight,
                Field::CreatedAt,
            ],
            Self::Tag => &[Field::Name, Field::Color],
        }
    }

    /// True if `field` belongs to this kind.
    #[must_use]
    pub fn has_field(self, field: Field) -> bool {
        self.fields().contains(&field)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A mergeable attribute of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Display name (text).
    Name,
    /// Icon reference (text).
    Icon,
    /// Encoded color blob.
    AccentColor,
    /// Creation instant (integer UTC milliseconds).
    CreatedAt,
    /// Free text.
    Description,
    /// Encoded image blob.
    Image,
    /// Array of decimals.
    Dimensions,
    /// Decimal.
    Weight,
    /// Encoded color blob.
    Color,
}

impl Field {
    const ALL: [Field; 9] = [
        Field::Name,
        Field::Icon,
        Field::AccentColor,
        Field::CreatedAt,
        Field::Description,
        Field::Image,
        Field::Dimensions,
        Field::Weight,
        Field::Color,
    ];

    /// Wire name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Icon => "icon",
            Self::AccentColor => "accent_color",
            Self::CreatedAt => "created_at",
            Self::Description => "description",
            Self::Image => "image",
            Self::Dimensions => "dimensions",
            Self::Weight => "weight",
            Self::Color => "color",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A relationship between two kinds.
///
/// The owner side is written; the inverse is derived by the relation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationRole {
    /// Item belongs to one storage root.
    ItemRoot,
    /// Box belongs to one storage root.
    BoxRoot,
    /// Item sits in at most one box.
    ItemBox,
    /// Item carries any number of tags.
    ItemTag,
}

impl RelationRole {
    const ALL: [RelationRole; 4] = [
        RelationRole::ItemRoot,
        RelationRole::BoxRoot,
        RelationRole::ItemBox,
        RelationRole::ItemTag,
    ];

    /// Wire name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ItemRoot => "item.root",
            Self::BoxRoot => "box.root",
            Self::ItemBox => "item.box",
            Self::ItemTag => "item.tags",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }

    /// Kind on the writing side.
    #[must_use]
    pub const fn owner(self) -> EntityKind {
        match self {
            Self::ItemRoot | Self::ItemBox | Self::ItemTag => EntityKind::Item,
            Self::BoxRoot => EntityKind::StorageBox,
        }
    }

    /// Kind on the referenced side.
    #[must_use]
    pub const fn target(self) -> EntityKind {
        match self {
            Self::ItemRoot | Self::BoxRoot => EntityKind::StorageRoot,
            Self::ItemBox => EntityKind::StorageBox,
            Self::ItemTag => EntityKind::Tag,
        }
    }

    /// True for the many-to-many role.
    #[must_use]
    pub const fn is_to_many(self) -> bool {
        matches!(self, Self::ItemTag)
    }
}

impl fmt::Display for RelationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

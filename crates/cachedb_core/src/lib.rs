//! # cachedb core
//!
//! The persistent object graph behind an inventory application.
//!
//! This crate provides:
//! - The entity model: storage roots, boxes, items and tags
//! - A store with versioned snapshots and a single writer
//! - Field-level last-writer-wins merging with tombstones that lose to
//!   edits they never saw
//! - A checksummed journal and commit pipeline that never drops pending
//!   changes on failure
//! - The [`Inventory`] handle with invariant-preserving domain operations
//!
//! ```rust,no_run
//! use cachedb_core::{Config, Inventory, NewItem, NewStorageRoot};
//!
//! # async fn demo() -> cachedb_core::CoreResult<()> {
//! let inventory = Inventory::open(Config::directory("inventory")).await?;
//! let garage = inventory
//!     .create_storage_root(NewStorageRoot::new("Garage"))
//!     .await?;
//! inventory
//!     .create_item(NewItem::new("Drill").in_root(garage))
//!     .await?;
//! assert_eq!(inventory.snapshot().items_in(&garage).len(), 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attribute;
mod change;
mod checksum;
mod clock;
mod commit_queue;
mod config;
mod dir;
mod error;
mod graph;
mod inventory;
mod journal;
mod model;
mod persistence;
mod preview;
mod store;
mod types;
mod views;

pub use attribute::{
    AttributeError, AttributeTransformer, AttributeType, Color, ColorTransformer, Image,
    ImageFormat, ImageTransformer, MAX_IMAGE_BYTES,
};
pub use change::{Change, ChangeTarget};
pub use clock::{HybridClock, ManualTimeSource, SystemTimeSource, TimeSource};
pub use commit_queue::CommitQueue;
pub use config::{Config, StoreLocation};
pub use dir::StoreDir;
pub use error::{CoreError, CoreResult};
pub use graph::{
    ConflictKind, Graph, MergeConflict, MergeReport, Record, RelationTable, Slot, ToMany, ToOne,
    Tombstone,
};
pub use inventory::{Inventory, ItemUpdate, NewItem, NewStorageRoot};
pub use journal::{Frame, FrameType, Journal, JournalEntry, Scan, JOURNAL_MAGIC, JOURNAL_VERSION};
pub use model::{EntityKind, Field, RelationRole};
pub use persistence::{
    CommitReceipt, CommitState, CommittedChange, Persistence, RecoveryReport, SyncCursor,
};
pub use preview::{seed as seed_preview, PREVIEW_ROOT};
pub use store::{EntityStore, Snapshot, Txn};
pub use types::{DeviceId, EntityId, SequenceNumber, Stamp};
pub use views::{Item, StorageBox, StorageRoot, Tag};

pub use cachedb_codec::{Decimal, Value};

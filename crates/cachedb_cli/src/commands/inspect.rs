//! Inspect command implementation.

use crate::Format;
use cachedb_core::{EntityKind, Inventory, RecoveryReport};
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// This installation's device id.
    pub device_id: String,
    /// When the store was created (RFC 3339).
    pub created_at: String,
    /// Whether sync is turned on.
    pub sync_enabled: bool,
    /// Last local sequence number the remote acknowledged.
    pub sent_seq: u64,
    /// Last remote cursor merged.
    pub remote_cursor: u64,
    /// Committed changes not yet acknowledged.
    pub unsent: usize,
    /// Highest committed sequence number.
    pub last_committed: u64,
    /// Journal frames replayed on open.
    pub frames: usize,
    /// Bytes dropped from a torn tail on open.
    pub truncated_bytes: u64,
    /// Live storage roots.
    pub storage_roots: usize,
    /// Live boxes.
    pub boxes: usize,
    /// Live items.
    pub items: usize,
    /// Live tags.
    pub tags: usize,
    /// Deleted entities still tracked.
    pub tombstones: usize,
}

impl InspectResult {
    /// Collects the result from an open store.
    pub fn collect(path: &Path, inventory: &Inventory, report: &RecoveryReport) -> Self {
        let persistence = inventory.persistence();
        let snapshot = inventory.snapshot();
        let cursor = persistence.cursor();
        Self {
            path: path.display().to_string(),
            device_id: inventory.device().to_string(),
            created_at: persistence.created_at().to_rfc3339(),
            sync_enabled: persistence.sync_enabled(),
            sent_seq: cursor.sent_seq.get(),
            remote_cursor: cursor.remote,
            unsent: persistence.unsent_len(),
            last_committed: persistence.last_committed().get(),
            frames: report.frames,
            truncated_bytes: report.truncated_bytes,
            storage_roots: snapshot.count(EntityKind::StorageRoot),
            boxes: snapshot.count(EntityKind::StorageBox),
            items: snapshot.count(EntityKind::Item),
            tags: snapshot.count(EntityKind::Tag),
            tombstones: snapshot.tombstones(),
        }
    }
}

/// Runs the inspect command.
pub async fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let (inventory, report) = super::open_existing(path).await?;
    let result = InspectResult::collect(path, &inventory, &report);
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("cachedb Store Inspection");
    println!("========================");
    println!();
    println!("Path:    {}", result.path);
    println!("Device:  {}", result.device_id);
    println!("Created: {}", result.created_at);
    println!();
    println!("Journal:");
    println!("  Frames:          {}", result.frames);
    println!("  Last committed:  {}", result.last_committed);
    if result.truncated_bytes > 0 {
        println!("  Torn tail:       {} bytes dropped", result.truncated_bytes);
    }
    println!();
    println!("Entities:");
    println!("  Storage roots: {}", result.storage_roots);
    println!("  Boxes:         {}", result.boxes);
    println!("  Items:         {}", result.items);
    println!("  Tags:          {}", result.tags);
    println!("  Tombstones:    {}", result.tombstones);
    println!();
    println!("Sync:");
    println!(
        "  Enabled:       {}",
        if result.sync_enabled { "yes" } else { "no" }
    );
    println!("  Sent seq:      {}", result.sent_seq);
    println!("  Remote cursor: {}", result.remote_cursor);
    println!("  Unsent:        {}", result.unsent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachedb_core::{Config, NewItem, NewStorageRoot};
    use tempfile::tempdir;

    #[tokio::test]
    async fn counts_live_entities_and_tombstones() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");
        {
            let inventory = Inventory::open(Config::directory(&path)).await.unwrap();
            let root = inventory
                .create_storage_root(NewStorageRoot::new("Garage"))
                .await
                .unwrap();
            let item = inventory
                .create_item(NewItem::new("Drill").in_root(root))
                .await
                .unwrap();
            inventory.create_tag("Fragile", None).await.unwrap();
            inventory.delete_item(item).await.unwrap();
        }

        let (inventory, report) = crate::commands::open_existing(&path).await.unwrap();
        let result = InspectResult::collect(&path, &inventory, &report);
        assert_eq!(result.storage_roots, 1);
        assert_eq!(result.items, 0);
        assert_eq!(result.tags, 1);
        assert_eq!(result.tombstones, 1);
        assert!(!result.sync_enabled);
        assert_eq!(result.unsent as u64, result.last_committed);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["storage_roots"], 1);
    }

    #[tokio::test]
    async fn missing_store_is_an_error() {
        let temp = tempdir().unwrap();
        assert!(crate::commands::open_existing(&temp.path().join("nope"))
            .await
            .is_err());
    }
}
